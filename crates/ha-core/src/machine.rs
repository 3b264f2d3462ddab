//! # machine
//!
//! why: the seam between the replicated log and the daemon's business state
//! relations: driven by log.rs apply_up_to, implemented by the daemon (sql backend) or MemoryMachine
//! what: StateMachine trait, MemoryMachine

use crate::LogIndex;
use parking_lot::Mutex;
use std::sync::Arc;

pub type ApplyError = Box<dyn std::error::Error + Send + Sync>;

/// Executes committed commands, strictly in index order.
pub trait StateMachine: Send {
    fn apply(&mut self, index: LogIndex, command: &str) -> std::result::Result<(), ApplyError>;
}

/// In-memory state machine recording every applied command.
///
/// Clones share the record so a test can keep a handle after handing one to a log store.
#[derive(Clone, Default)]
pub struct MemoryMachine {
    applied: Arc<Mutex<Vec<(LogIndex, String)>>>,
    /// commands starting with this prefix fail to apply
    reject_prefix: Option<String>,
}

impl MemoryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(prefix: impl Into<String>) -> Self {
        Self {
            reject_prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn applied(&self) -> Vec<(LogIndex, String)> {
        self.applied.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.applied.lock().iter().map(|(_, c)| c.clone()).collect()
    }
}

impl StateMachine for MemoryMachine {
    fn apply(&mut self, index: LogIndex, command: &str) -> std::result::Result<(), ApplyError> {
        if let Some(prefix) = &self.reject_prefix {
            if command.starts_with(prefix.as_str()) {
                return Err(format!("rejected command {command:?}").into());
            }
        }
        self.applied.lock().push((index, command.to_string()));
        Ok(())
    }
}
