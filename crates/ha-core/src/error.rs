//! # error
//!
//! why: one error type for every failure class the core can surface
//! relations: returned by log.rs, raft/, federation.rs, config.rs and the transports
//! what: HaError, Result alias

use crate::{LogIndex, ServerId, Term, ZoneId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaError {
    /// Persistence failures are hard errors: the log is the durability boundary.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Log entry {index} not found")]
    NotFound { index: LogIndex },

    #[error("Log mismatch at {index}: expected previous term {expected}, found {found:?}")]
    LogMismatch {
        index: LogIndex,
        expected: Term,
        found: Option<Term>,
    },

    #[error("Refusing to overwrite applied entry {index}")]
    AppliedConflict { index: LogIndex },

    #[error("Not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<ServerId> },

    #[error("Leader is still reconciling its log")]
    Reconciling,

    #[error("Write {index} failed: {reason}")]
    QuorumFailed { index: LogIndex, reason: String },

    #[error("Write {index} not replicated to a quorum within {timeout:?}")]
    QuorumTimeout { index: LogIndex, timeout: Duration },

    #[error("Transport error to {target}: {message}")]
    Transport { target: String, message: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Zone {zone} rejected federated entry {index} (last known: {last_known:?})")]
    FederationMismatch {
        zone: ZoneId,
        index: LogIndex,
        last_known: Option<LogIndex>,
    },

    #[error("Federated entry {index} is no longer in the log")]
    FederationGap { index: LogIndex },

    /// The entry exists but is not applied yet; it may still be rolled back.
    #[error("Log entry {index} is not committed yet (applied through {applied})")]
    NotCommitted { index: LogIndex, applied: LogIndex },

    #[error("Apply failed at {index}: {reason}")]
    Apply { index: LogIndex, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unknown server: {0}")]
    UnknownServer(ServerId),

    #[error("Unknown zone: {0}")]
    UnknownZone(ZoneId),
}

pub type Result<T> = std::result::Result<T, HaError>;

impl HaError {
    pub fn transport(target: impl ToString, message: impl Into<String>) -> Self {
        HaError::Transport {
            target: target.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        HaError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        HaError::Configuration {
            message: message.into(),
        }
    }

    /// Failures the owning replica worker should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HaError::Transport { .. }
                | HaError::Timeout { .. }
                | HaError::NotFound { .. }
                | HaError::FederationMismatch { .. }
                | HaError::FederationGap { .. }
                | HaError::NotCommitted { .. }
        )
    }
}
