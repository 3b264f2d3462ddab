//! # ha-core
//!
//! why: keep a cluster of servers agreeing on one ordered log of commands, and forward
//! part of it to child zones
//! relations: persists through ha-storage; the daemon supplies the state machine and the rpc transports
//! what: replicated log store, raft election and replication, replica worker pools,
//! quorum wait map, federation, in-process transports for tests

pub mod config;
pub mod error;
pub mod federation;
pub mod local;
pub mod log;
pub mod machine;
pub mod message;
pub mod node;
pub mod quorum;
pub mod raft;
pub mod replica;
pub mod server;
pub mod transport;

pub type ServerId = u64;
pub type ZoneId = u32;
pub type Term = u32;
pub type LogIndex = u64;

pub use config::{FederationConfig, FederationMode, HaConfig, ServerEndpoint, ZoneEndpoint};
pub use error::{HaError, Result};
pub use federation::{FederationManager, LogWriter, ZoneCursor};
pub use ha_storage::{FileStorage, InMemoryStorage, LogEntry, RaftStateRecord, Storage};
pub use local::{LocalNetwork, LocalZoneNetwork};
pub use log::{Federation, LogStore};
pub use machine::{MemoryMachine, StateMachine};
pub use message::{
    AppendRequest, AppendResponse, FederatedRequest, FederatedResponse, VoteRequest, VoteResponse,
};
pub use node::{PeerProgress, Role};
pub use quorum::{QuorumWaitMap, ReplicationWaiter, WaitOutcome};
pub use raft::{RaftManager, RaftStatus, RoleListener};
pub use replica::{ReplicaPool, RetryPolicy};
pub use server::HaServer;
pub use transport::{PeerHandler, PeerTransport, ZoneHandler, ZoneTransport};
