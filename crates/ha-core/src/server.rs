//! # server
//!
//! why: construct the core once and hand each component the others it needs
//! relations: owns log.rs LogStore, raft/ RaftManager and federation.rs FederationManager
//! what: HaServer (open, start, write, write_federated, status, shutdown, rpc entry points)

use crate::config::{FederationMode, HaConfig};
use crate::error::{HaError, Result};
use crate::federation::FederationManager;
use crate::log::{Federation, LogStore};
use crate::machine::StateMachine;
use crate::message::{
    AppendRequest, AppendResponse, FederatedRequest, FederatedResponse, VoteRequest, VoteResponse,
};
use crate::raft::{RaftManager, RaftStatus, RoleListener};
use crate::transport::{PeerHandler, PeerTransport, ZoneHandler, ZoneTransport};
use crate::LogIndex;
use ha_storage::Storage;
use std::sync::Arc;
use tracing::info;

/// One server of the HA core: log store, raft and federation wired together
pub struct HaServer {
    config: HaConfig,
    log: Arc<LogStore>,
    raft: Arc<RaftManager>,
    federation: Arc<FederationManager>,
}

impl HaServer {
    /// Recover the log from `storage` and build the managers. Nothing runs until [`HaServer::start`].
    pub fn open(
        config: HaConfig,
        storage: Box<dyn Storage>,
        machine: Box<dyn StateMachine>,
        peers: Arc<dyn PeerTransport>,
        zones: Option<Arc<dyn ZoneTransport>>,
    ) -> Result<Self> {
        config.validate()?;

        let log = Arc::new(LogStore::open(storage, machine)?);
        let raft = RaftManager::new(&config, log.clone(), peers);
        let federation = FederationManager::new(&config, log.clone(), raft.clone(), zones)?;

        let listener: Arc<dyn RoleListener> = federation.clone();
        raft.add_listener(Arc::downgrade(&listener));

        let (last_index, last_term) = log.last_index_and_term();
        info!(
            server_id = config.server_id,
            servers = config.servers.len(),
            last_index,
            last_term,
            last_applied = log.last_applied(),
            federation = ?config.federation.mode,
            "opened HA server"
        );

        Ok(Self {
            config,
            log,
            raft,
            federation,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.raft.start()
    }

    pub fn shutdown(&self) {
        self.federation.stop();
        self.raft.shutdown();
    }

    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    pub fn raft(&self) -> &Arc<RaftManager> {
        &self.raft
    }

    pub fn federation(&self) -> &Arc<FederationManager> {
        &self.federation
    }

    /// Replicate a zone-local command and apply it once committed
    pub fn write(&self, command: &str) -> Result<LogIndex> {
        self.raft.write(command, Federation::Local)
    }

    /// Replicate a command that also propagates to child zones. Master zones only.
    pub fn write_federated(&self, command: &str) -> Result<LogIndex> {
        if self.federation.mode() != FederationMode::Master {
            return Err(HaError::config("federated writes need a federation master"));
        }

        let index = self.raft.write(command, Federation::Origin)?;
        self.federation.replicate();
        Ok(index)
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }

    /// Peer handler to register with whatever serves this server's rpcs
    pub fn peer_handler(&self) -> Arc<dyn PeerHandler> {
        self.raft.clone()
    }

    pub fn zone_handler(&self) -> Arc<dyn ZoneHandler> {
        self.federation.clone()
    }

    pub fn handle_request_vote(&self, request: &VoteRequest) -> Result<VoteResponse> {
        self.raft.handle_request_vote(request)
    }

    pub fn handle_append_log(&self, request: &AppendRequest) -> Result<AppendResponse> {
        self.raft.handle_append_log(request)
    }

    pub fn handle_federated_replicate(&self, request: &FederatedRequest) -> Result<FederatedResponse> {
        self.federation.handle_federated_replicate(request)
    }
}

impl Drop for HaServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
