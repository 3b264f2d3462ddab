//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by raft/ for replication and commit, by federation.rs for the federated index space, persisted via ha-storage
//! what: LogStore (append, consistency check, truncation, ordered apply, purge), Federation marking

use crate::error::{HaError, Result};
use crate::machine::StateMachine;
use crate::{LogIndex, Term};
use chrono::Utc;
use ha_storage::{LogEntry, RaftStateRecord, Storage};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// How an appended entry takes part in federation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Federation {
    /// Stays inside this zone
    Local,
    /// New federated entry created here; its federated index is its own log index
    Origin,
    /// Entry received from the master zone, keeps the master's federated index
    Replica(LogIndex),
}

struct LogInner {
    storage: Box<dyn Storage>,
    machine: Box<dyn StateMachine>,
    entries: BTreeMap<LogIndex, LogEntry>,
    /// federated index -> log index
    federated: BTreeMap<LogIndex, LogIndex>,
    last_index: LogIndex,
    last_term: Term,
    last_applied: LogIndex,
    raft_state: RaftStateRecord,
}

impl LogInner {
    fn insert(&mut self, entry: LogEntry) -> Result<()> {
        self.storage.put_entry(&entry)?;

        if entry.index >= self.last_index {
            self.last_index = entry.index;
            self.last_term = entry.term;
        }
        if let Some(fed) = entry.federated_index {
            self.federated.insert(fed, entry.index);
        }
        self.entries.insert(entry.index, entry);
        Ok(())
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.last_index {
            return Some(self.last_term);
        }
        self.entries.get(&index).map(|e| e.term)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<usize> {
        if index <= self.last_applied {
            return Err(HaError::AppliedConflict { index });
        }

        let removed = self.entries.range(index..).count();
        if removed == 0 {
            return Ok(0);
        }

        self.storage.truncate_log_from(index)?;
        self.entries.retain(|&i, _| i < index);
        self.federated.retain(|_, i| *i < index);

        // the apply frontier is never purged, so a predecessor is always cached
        let (last_index, last_term) = self
            .entries
            .iter()
            .next_back()
            .map(|(i, e)| (*i, e.term))
            .unwrap_or((0, 0));
        self.last_index = last_index;
        self.last_term = last_term;

        Ok(removed)
    }

    fn delete(&mut self, indices: &[LogIndex]) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }

        self.storage.delete_entries(indices)?;
        for index in indices {
            if let Some(entry) = self.entries.remove(index) {
                if let Some(fed) = entry.federated_index {
                    self.federated.remove(&fed);
                }
            }
        }
        Ok(indices.len())
    }
}

/// The replicated log of one server.
///
/// Index counters, the entry table and the apply cursor sit behind a single
/// mutex; [`LogStore::apply_up_to`] runs under it, so application is never
/// concurrent with itself.
pub struct LogStore {
    inner: Mutex<LogInner>,
}

impl LogStore {
    /// Recover the log from `storage`, bootstrapping the index 0 sentinel on an empty store
    pub fn open(mut storage: Box<dyn Storage>, machine: Box<dyn StateMachine>) -> Result<Self> {
        let persisted = storage.load()?;

        let mut entries: BTreeMap<LogIndex, LogEntry> =
            persisted.entries.into_iter().map(|e| (e.index, e)).collect();

        if entries.is_empty() {
            let sentinel = LogEntry::sentinel(Utc::now().timestamp());
            storage.put_entry(&sentinel)?;
            entries.insert(0, sentinel);
        }

        let federated = entries
            .values()
            .filter_map(|e| e.federated_index.map(|fed| (fed, e.index)))
            .collect();

        let (last_index, last_term) = entries
            .iter()
            .next_back()
            .map(|(i, e)| (*i, e.term))
            .unwrap_or((0, 0));

        // applied entries form a prefix of the log
        let last_applied = entries
            .values()
            .take_while(|e| e.is_applied())
            .last()
            .map(|e| e.index)
            .unwrap_or(0);

        info!(
            last_index,
            last_term,
            last_applied,
            term = persisted.raft_state.term,
            "log store recovered"
        );

        Ok(Self {
            inner: Mutex::new(LogInner {
                storage,
                machine,
                entries,
                federated,
                last_index,
                last_term,
                last_applied,
                raft_state: persisted.raft_state,
            }),
        })
    }

    /// The persisted `{term, voted_for}` record
    pub fn raft_state(&self) -> RaftStateRecord {
        self.inner.lock().raft_state
    }

    pub fn save_raft_state(&self, state: RaftStateRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.storage.save_raft_state(&state)?;
        inner.raft_state = state;
        Ok(())
    }

    /// Append a new entry at the next dense index and return that index.
    ///
    /// `applied` records that the command already ran against the state
    /// machine; it is only accepted while the apply cursor is at the log head.
    pub fn append(&self, term: Term, command: impl Into<String>, applied: bool, federation: Federation) -> Result<LogIndex> {
        let mut inner = self.inner.lock();

        let index = inner.last_index + 1;
        if applied && inner.last_applied != inner.last_index {
            return Err(HaError::Apply {
                index,
                reason: format!("entries up to {} are not applied yet", inner.last_index),
            });
        }

        let federated_index = match federation {
            Federation::Local => None,
            Federation::Origin => Some(index),
            Federation::Replica(fed) => Some(fed),
        };

        let mut entry = LogEntry::new(index, term, inner.last_index, inner.last_term, command)
            .with_federated_index(federated_index);
        if applied {
            entry.applied_at = Utc::now().timestamp();
        }

        inner.insert(entry)?;
        if applied {
            inner.last_applied = index;
        }

        debug!(index, term, ?federated_index, "appended log entry");
        Ok(index)
    }

    /// Index the next append will take
    pub fn next_index(&self) -> LogIndex {
        self.inner.lock().last_index + 1
    }

    /// Store an entry at its own index (follower side).
    ///
    /// An entry already present with the same term and predecessor is an
    /// idempotent success. A different entry is an error unless `replace` is
    /// set, in which case the log is truncated from that index first.
    /// Callers check [`LogStore::check_consistency`] beforehand.
    pub fn put(&self, entry: LogEntry, replace: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = entry.index;

        if let Some(existing) = inner.entries.get(&index) {
            if existing.term == entry.term && existing.prev_index == entry.prev_index {
                return Ok(());
            }
            if !replace {
                return Err(HaError::LogMismatch {
                    index,
                    expected: entry.term,
                    found: Some(existing.term),
                });
            }
            if existing.is_applied() {
                return Err(HaError::AppliedConflict { index });
            }

            let removed = inner.truncate_from(index)?;
            info!(index, removed, "truncated conflicting log suffix");
        } else if index <= inner.last_index {
            // below the head but gone: purged, hence applied
            return Err(HaError::AppliedConflict { index });
        } else if index > inner.last_index + 1 {
            return Err(HaError::LogMismatch {
                index,
                expected: entry.prev_term,
                found: None,
            });
        }

        inner.insert(entry)
    }

    /// Confirm the stored predecessor of `entry` carries `entry.prev_term`
    pub fn check_consistency(&self, entry: &LogEntry) -> Result<()> {
        let inner = self.inner.lock();
        match inner.term_at(entry.prev_index) {
            Some(term) if term == entry.prev_term => Ok(()),
            found => Err(HaError::LogMismatch {
                index: entry.index,
                expected: entry.prev_term,
                found,
            }),
        }
    }

    /// Whether the log holds an entry at `index` with `term`
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.inner.lock().term_at(index) == Some(term)
    }

    /// The entry at `index` and its predecessor, if still stored
    pub fn get(&self, index: LogIndex) -> Result<(LogEntry, Option<LogEntry>)> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&index)
            .cloned()
            .ok_or(HaError::NotFound { index })?;
        let prev = index
            .checked_sub(1)
            .and_then(|p| inner.entries.get(&p).cloned());
        Ok((entry, prev))
    }

    pub fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.inner.lock().entries.get(&index).cloned()
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.inner.lock().term_at(index)
    }

    /// Remove every entry from `index` on; applied entries are never removed
    pub fn delete_from(&self, index: LogIndex) -> Result<usize> {
        self.inner.lock().truncate_from(index)
    }

    /// Apply entries `last_applied + 1 ..= commit` in order and return how many ran.
    ///
    /// Stops at the first entry the state machine rejects; the cursor stays in
    /// front of it so a later call retries it.
    pub fn apply_up_to(&self, commit: LogIndex) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let target = commit.min(inner.last_index);
        let mut applied = 0;

        while inner.last_applied < target {
            let index = inner.last_applied + 1;
            let entry = inner
                .entries
                .get_mut(&index)
                .ok_or(HaError::NotFound { index })?;

            if !entry.is_applied() {
                if let Err(e) = inner.machine.apply(index, &entry.command) {
                    error!(index, error = %e, "state machine rejected log entry");
                    return Err(HaError::Apply {
                        index,
                        reason: e.to_string(),
                    });
                }

                let now = Utc::now().timestamp().max(1);
                inner.storage.mark_applied(index, now)?;
                entry.applied_at = now;
            }

            inner.last_applied = index;
            applied += 1;
        }

        if applied > 0 {
            debug!(applied, last_applied = inner.last_applied, "applied log entries");
        }
        Ok(applied)
    }

    /// Delete applied, non-federated entries beyond the `retention` most recent
    /// applied ones, oldest first, at most `batch_limit` per call.
    ///
    /// The sentinel and the entry at the apply cursor always survive.
    pub fn purge(&self, retention: u64, batch_limit: usize) -> Result<usize> {
        let mut inner = self.inner.lock();

        let cutoff = inner.last_applied.saturating_sub(retention.max(1));
        let victims: Vec<LogIndex> = inner
            .entries
            .range(1..=cutoff)
            .filter(|(_, e)| e.federated_index.is_none() && e.is_applied())
            .map(|(i, _)| *i)
            .take(batch_limit)
            .collect();

        let purged = inner.delete(&victims)?;
        if purged > 0 {
            debug!(purged, cutoff, "purged log entries");
        }
        Ok(purged)
    }

    /// Same as [`LogStore::purge`] for the federated index space, with the
    /// window counted in federated indexes.
    pub fn purge_federated(&self, retention: u64, batch_limit: usize) -> Result<usize> {
        let mut inner = self.inner.lock();

        let last_applied = inner.last_applied;
        let Some(last_fed) = inner
            .federated
            .iter()
            .rev()
            .find(|(_, i)| **i <= last_applied)
            .map(|(fed, _)| *fed)
        else {
            return Ok(0);
        };

        let cutoff = last_fed.saturating_sub(retention.max(1));
        let victims: Vec<LogIndex> = inner
            .federated
            .range(..=cutoff)
            .map(|(_, i)| *i)
            .filter(|i| *i > 0 && *i < last_applied)
            .take(batch_limit)
            .collect();

        let purged = inner.delete(&victims)?;
        if purged > 0 {
            debug!(purged, cutoff, "purged federated log entries");
        }
        Ok(purged)
    }

    pub fn last_index_and_term(&self) -> (LogIndex, Term) {
        let inner = self.inner.lock();
        (inner.last_index, inner.last_term)
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.lock().last_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.lock().last_applied
    }

    /// Number of stored entries, sentinel included
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- federated index space --

    pub fn last_federated(&self) -> Option<LogIndex> {
        self.inner.lock().federated.keys().next_back().copied()
    }

    /// Smallest federated index greater than `index`
    pub fn next_federated(&self, index: LogIndex) -> Option<LogIndex> {
        let inner = self.inner.lock();
        let next = inner.federated.range(index.saturating_add(1)..).next().map(|(f, _)| *f);
        next
    }

    /// Largest federated index smaller than `index`
    pub fn previous_federated(&self, index: LogIndex) -> Option<LogIndex> {
        let inner = self.inner.lock();
        let prev = inner.federated.range(..index).next_back().map(|(f, _)| *f);
        prev
    }

    /// First federated entry whose federated index is `index` or later
    pub fn get_federated_from(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.lock();
        let (_, log_index) = inner.federated.range(index..).next()?;
        inner.entries.get(log_index).cloned()
    }
}
