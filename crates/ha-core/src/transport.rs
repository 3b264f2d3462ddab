//! # transport
//!
//! why: keep the protocol independent of how rpcs travel
//! relations: raft/ calls PeerTransport, federation.rs calls ZoneTransport; both managers implement the handler side
//! what: PeerTransport, ZoneTransport (client side), PeerHandler, ZoneHandler (server side)

use crate::error::Result;
use crate::message::{
    AppendRequest, AppendResponse, FederatedRequest, FederatedResponse, VoteRequest, VoteResponse,
};
use crate::{ServerId, ZoneId};
use std::time::Duration;

/// Outgoing rpcs to cluster peers.
///
/// A timeout must be reported as an error, exactly like any other failure.
pub trait PeerTransport: Send + Sync {
    fn request_vote(&self, peer: ServerId, request: &VoteRequest, timeout: Duration) -> Result<VoteResponse>;

    fn append_log(&self, peer: ServerId, request: &AppendRequest, timeout: Duration) -> Result<AppendResponse>;
}

/// Outgoing rpcs to child zones
pub trait ZoneTransport: Send + Sync {
    fn federated_replicate(
        &self,
        zone: ZoneId,
        request: &FederatedRequest,
        timeout: Duration,
    ) -> Result<FederatedResponse>;
}

/// Incoming peer rpcs
pub trait PeerHandler: Send + Sync {
    fn handle_request_vote(&self, request: &VoteRequest) -> Result<VoteResponse>;

    fn handle_append_log(&self, request: &AppendRequest) -> Result<AppendResponse>;
}

/// Incoming federation rpcs
pub trait ZoneHandler: Send + Sync {
    fn handle_federated_replicate(&self, request: &FederatedRequest) -> Result<FederatedResponse>;
}
