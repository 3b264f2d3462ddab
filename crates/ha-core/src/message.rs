//! # message
//!
//! why: define the rpc payloads exchanged between servers and between zones
//! relations: built by raft/ and federation.rs, carried by transport.rs implementations
//! what: VoteRequest/VoteResponse, AppendRequest/AppendResponse (heartbeat variant), FederatedRequest/FederatedResponse

use crate::{LogEntry, LogIndex, ServerId, Term};
use serde::{Deserialize, Serialize};

/// RequestVote arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to a vote request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,
    /// the voter's term after handling the request
    pub term: Term,
}

/// AppendLog arguments.
///
/// `index == 0` with an empty command is a heartbeat; its `prev_index`/`prev_term`
/// then name the leader's last entry so the follower can report whether it holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub leader_id: ServerId,
    pub leader_commit: LogIndex,
    pub leader_term: Term,
    pub index: LogIndex,
    pub term: Term,
    pub prev_index: LogIndex,
    pub prev_term: Term,
    pub federated_index: Option<LogIndex>,
    pub command: String,
}

impl AppendRequest {
    /// Build the request carrying `entry`
    pub fn entry(leader_id: ServerId, leader_term: Term, leader_commit: LogIndex, entry: &LogEntry) -> Self {
        Self {
            leader_id,
            leader_commit,
            leader_term,
            index: entry.index,
            term: entry.term,
            prev_index: entry.prev_index,
            prev_term: entry.prev_term,
            federated_index: entry.federated_index,
            command: entry.command.clone(),
        }
    }

    pub fn heartbeat(
        leader_id: ServerId,
        leader_term: Term,
        leader_commit: LogIndex,
        last_index: LogIndex,
        last_term: Term,
    ) -> Self {
        Self {
            leader_id,
            leader_commit,
            leader_term,
            index: 0,
            term: 0,
            prev_index: last_index,
            prev_term: last_term,
            federated_index: None,
            command: String::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.index == 0 && self.command.is_empty()
    }

    /// The log entry this request asks the follower to store
    pub fn to_entry(&self) -> LogEntry {
        LogEntry::new(self.index, self.term, self.prev_index, self.prev_term, self.command.clone())
            .with_federated_index(self.federated_index)
    }
}

/// Response to AppendLog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub success: bool,
    pub term: Term,
}

/// FederatedReplicate arguments: one entry of the federated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedRequest {
    pub index: LogIndex,
    /// federated index of the preceding federated entry, None for the first one
    pub prev_index: Option<LogIndex>,
    pub command: String,
}

/// Response to FederatedReplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedResponse {
    pub success: bool,
    /// the receiving zone's last federated index
    pub last_known_index: Option<LogIndex>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_recognised() {
        let hb = AppendRequest::heartbeat(1, 3, 7, 9, 3);
        assert!(hb.is_heartbeat());
        assert_eq!(hb.prev_index, 9);

        let entry = LogEntry::new(10, 3, 9, 3, "UPDATE pool SET x=1");
        assert!(!AppendRequest::entry(1, 3, 7, &entry).is_heartbeat());
    }

    #[test]
    fn request_carries_entry_identity() {
        let entry = LogEntry::new(4, 2, 3, 1, "INSERT").with_federated_index(Some(4));
        let req = AppendRequest::entry(1, 2, 3, &entry);

        assert_eq!(req.to_entry(), entry);
    }

    #[test]
    fn messages_serialize_as_json() {
        let req = FederatedRequest {
            index: 8,
            prev_index: Some(7),
            command: "INSERT".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: FederatedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
