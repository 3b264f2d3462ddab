//! # local
//!
//! why: run several servers and zones inside one process
//! relations: implements transport.rs traits over direct calls into registered handlers
//! what: LocalNetwork (peers, with partitions), LocalZoneNetwork (zones, with outages)

use crate::error::{HaError, Result};
use crate::message::{
    AppendRequest, AppendResponse, FederatedRequest, FederatedResponse, VoteRequest, VoteResponse,
};
use crate::transport::{PeerHandler, PeerTransport, ZoneHandler, ZoneTransport};
use crate::{ServerId, ZoneId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// In-process cluster network.
///
/// Calls run synchronously on the caller's thread. A partitioned link fails
/// at once with [`HaError::Timeout`], the error a real transport raises when
/// its deadline passes; a server that was never registered (or was dropped)
/// is a transport error.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<ServerId, Weak<dyn PeerHandler>>>,
    isolated: RwLock<HashSet<ServerId>>,
    /// cut links, stored with the smaller id first
    cut: RwLock<HashSet<(ServerId, ServerId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: ServerId, handler: Weak<dyn PeerHandler>) {
        self.handlers.write().insert(id, handler);
    }

    pub fn unregister(&self, id: ServerId) {
        self.handlers.write().remove(&id);
    }

    /// Transport used by server `from`
    pub fn transport(self: &Arc<Self>, from: ServerId) -> Arc<dyn PeerTransport> {
        Arc::new(LocalTransport {
            from,
            network: self.clone(),
        })
    }

    /// Cut `id` off from every other server
    pub fn isolate(&self, id: ServerId) {
        self.isolated.write().insert(id);
    }

    pub fn heal(&self, id: ServerId) {
        self.isolated.write().remove(&id);
    }

    /// Cut the link between two servers, both directions
    pub fn cut(&self, a: ServerId, b: ServerId) {
        self.cut.write().insert((a.min(b), a.max(b)));
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
        self.cut.write().clear();
    }

    pub fn reachable(&self, from: ServerId, to: ServerId) -> bool {
        let isolated = self.isolated.read();
        if isolated.contains(&from) || isolated.contains(&to) {
            return false;
        }
        !self.cut.read().contains(&(from.min(to), from.max(to)))
    }

    fn handler(&self, from: ServerId, to: ServerId, operation: &str, timeout: Duration) -> Result<Arc<dyn PeerHandler>> {
        if !self.reachable(from, to) {
            return Err(HaError::timeout(format!("{operation} to server {to}"), timeout));
        }
        self.handlers
            .read()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| HaError::transport(to, "no such server"))
    }
}

struct LocalTransport {
    from: ServerId,
    network: Arc<LocalNetwork>,
}

impl PeerTransport for LocalTransport {
    fn request_vote(&self, peer: ServerId, request: &VoteRequest, timeout: Duration) -> Result<VoteResponse> {
        trace!(from = self.from, to = peer, term = request.term, "request_vote");
        self.network
            .handler(self.from, peer, "request_vote", timeout)?
            .handle_request_vote(request)
            .map_err(|e| HaError::transport(peer, e.to_string()))
    }

    fn append_log(&self, peer: ServerId, request: &AppendRequest, timeout: Duration) -> Result<AppendResponse> {
        trace!(from = self.from, to = peer, index = request.index, "append_log");
        self.network
            .handler(self.from, peer, "append_log", timeout)?
            .handle_append_log(request)
            .map_err(|e| HaError::transport(peer, e.to_string()))
    }
}

/// In-process federation network
#[derive(Default)]
pub struct LocalZoneNetwork {
    zones: RwLock<HashMap<ZoneId, Weak<dyn ZoneHandler>>>,
    down: RwLock<HashSet<ZoneId>>,
}

impl LocalZoneNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, zone: ZoneId, handler: Weak<dyn ZoneHandler>) {
        self.zones.write().insert(zone, handler);
    }

    pub fn set_down(&self, zone: ZoneId, down: bool) {
        if down {
            self.down.write().insert(zone);
        } else {
            self.down.write().remove(&zone);
        }
    }
}

impl ZoneTransport for LocalZoneNetwork {
    fn federated_replicate(
        &self,
        zone: ZoneId,
        request: &FederatedRequest,
        timeout: Duration,
    ) -> Result<FederatedResponse> {
        if self.down.read().contains(&zone) {
            return Err(HaError::timeout(format!("federated_replicate to zone {zone}"), timeout));
        }

        let handler = self
            .zones
            .read()
            .get(&zone)
            .and_then(Weak::upgrade)
            .ok_or(HaError::UnknownZone(zone))?;

        handler
            .handle_federated_replicate(request)
            .map_err(|e| HaError::transport(format!("zone {zone}"), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl PeerHandler for Echo {
        fn handle_request_vote(&self, request: &VoteRequest) -> Result<VoteResponse> {
            Ok(VoteResponse {
                granted: true,
                term: request.term,
            })
        }

        fn handle_append_log(&self, request: &AppendRequest) -> Result<AppendResponse> {
            Ok(AppendResponse {
                success: true,
                term: request.leader_term,
            })
        }
    }

    fn vote(term: u32) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[test]
    fn partitions_block_both_directions() {
        let net = LocalNetwork::new();
        let echo: Arc<dyn PeerHandler> = Arc::new(Echo);
        net.register(2, Arc::downgrade(&echo));
        let t = net.transport(1);

        assert!(t.request_vote(2, &vote(1), Duration::from_millis(10)).unwrap().granted);

        net.cut(2, 1);
        let err = t.request_vote(2, &vote(1), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, HaError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(!net.reachable(2, 1));

        net.heal_all();
        net.isolate(1);
        assert!(t.request_vote(2, &vote(1), Duration::from_millis(10)).is_err());
        net.heal(1);
        assert!(t.request_vote(2, &vote(1), Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn dropped_handler_is_unreachable() {
        let net = LocalNetwork::new();
        {
            let echo: Arc<dyn PeerHandler> = Arc::new(Echo);
            net.register(2, Arc::downgrade(&echo));
        }
        assert!(matches!(
            net.transport(1).request_vote(2, &vote(1), Duration::ZERO),
            Err(HaError::Transport { .. })
        ));
    }

    #[test]
    fn zone_outage_times_out() {
        let net = LocalZoneNetwork::new();
        net.set_down(2, true);
        let request = FederatedRequest {
            index: 1,
            prev_index: None,
            command: "INSERT".into(),
        };

        let err = net.federated_replicate(2, &request, Duration::from_millis(25)).unwrap_err();
        assert!(matches!(err, HaError::Timeout { duration, .. } if duration == Duration::from_millis(25)));
    }
}
