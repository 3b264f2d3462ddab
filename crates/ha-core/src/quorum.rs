//! # quorum
//!
//! why: block a writer until enough followers hold its entry, or until leadership is lost
//! relations: filled by raft/ replication acks, waited on by the raft/ write path and reconciliation
//! what: ReplicationWaiter, ReplicationRequest, QuorumWaitMap

use crate::LogIndex;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a replication request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Replicated,
    Failed(String),
    TimedOut,
}

/// Blocking handle a writer parks on. Resolved at most once.
#[derive(Default)]
pub struct ReplicationWaiter {
    result: Mutex<Option<std::result::Result<(), String>>>,
    cond: Condvar,
}

impl ReplicationWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// First resolution wins; later ones are ignored
    fn resolve(&self, result: std::result::Result<(), String>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.cond.notify_all();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.lock().is_some()
    }

    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock();

        while slot.is_none() {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }

        match slot.as_ref() {
            Some(Ok(())) => WaitOutcome::Replicated,
            Some(Err(reason)) => WaitOutcome::Failed(reason.clone()),
            None => WaitOutcome::TimedOut,
        }
    }
}

/// Outstanding write waiting for follower acks
#[derive(Default)]
pub struct ReplicationRequest {
    pub index: LogIndex,
    /// acks still missing
    pub replies_needed: usize,
    /// acks received so far
    pub replicas: usize,
    waiter: Option<Arc<ReplicationWaiter>>,
    /// quorum reached before a waiter was attached
    done: bool,
}

/// Pending log index -> writer waiting on it.
#[derive(Default)]
pub struct QuorumWaitMap {
    requests: Mutex<BTreeMap<LogIndex, ReplicationRequest>>,
}

impl QuorumWaitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acks beyond the leader's own copy needed for a majority of `num_servers`
    pub fn replies_needed(num_servers: usize) -> usize {
        num_servers / 2
    }

    /// Announce that a writer will wait on `index`.
    ///
    /// Called before the entry is visible to replication so no ack can be lost.
    pub fn allocate(&self, index: LogIndex, replies_needed: usize) {
        self.requests.lock().insert(
            index,
            ReplicationRequest {
                index,
                replies_needed,
                replicas: 0,
                waiter: None,
                done: replies_needed == 0,
            },
        );
    }

    /// Attach the blocking handle. Resolves it at once if quorum was already reached.
    pub fn set(&self, index: LogIndex, waiter: Arc<ReplicationWaiter>) {
        let mut requests = self.requests.lock();
        match requests.get_mut(&index) {
            Some(request) if request.done => {
                requests.remove(&index);
                waiter.resolve(Ok(()));
            }
            Some(request) => request.waiter = Some(waiter),
            None => waiter.resolve(Err(format!("no replication request for index {index}"))),
        }
    }

    /// Count one follower ack for `index`; returns the acks still missing,
    /// or None when nothing waits on that index.
    pub fn add_replica(&self, index: LogIndex) -> Option<usize> {
        let mut requests = self.requests.lock();
        Self::ack(&mut requests, index)
    }

    /// Count one ack for every pending index in `from..=to`
    pub fn add_replica_range(&self, from: LogIndex, to: LogIndex) {
        if from > to {
            return;
        }

        let mut requests = self.requests.lock();
        let pending: Vec<LogIndex> = requests.range(from..=to).map(|(i, _)| *i).collect();
        for index in pending {
            Self::ack(&mut requests, index);
        }
    }

    fn ack(requests: &mut BTreeMap<LogIndex, ReplicationRequest>, index: LogIndex) -> Option<usize> {
        let request = requests.get_mut(&index)?;
        if request.done {
            return Some(0);
        }

        request.replicas += 1;
        request.replies_needed = request.replies_needed.saturating_sub(1);
        let remaining = request.replies_needed;

        if remaining == 0 {
            match request.waiter.take() {
                Some(waiter) => {
                    requests.remove(&index);
                    waiter.resolve(Ok(()));
                }
                None => request.done = true,
            }
        }
        Some(remaining)
    }

    /// Drop the request for `index`, failing its waiter (writer timeout)
    pub fn remove(&self, index: LogIndex, reason: &str) {
        if let Some(request) = self.requests.lock().remove(&index) {
            if let Some(waiter) = request.waiter {
                waiter.resolve(Err(reason.to_string()));
            }
        }
    }

    /// Fail every outstanding request; called on each step-down from leader
    pub fn clear(&self, reason: &str) -> usize {
        let drained = std::mem::take(&mut *self.requests.lock());
        let count = drained.len();
        for (_, request) in drained {
            if let Some(waiter) = request.waiter {
                waiter.resolve(Err(reason.to_string()));
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn majority_of_any_cluster_size() {
        // leader plus floor(n/2) acks is a strict majority for odd and even sizes
        for n in 1..=8usize {
            let acks = QuorumWaitMap::replies_needed(n);
            assert!(2 * (acks + 1) > n, "n={n}");
            assert!(2 * acks <= n, "n={n}");
        }
        assert_eq!(QuorumWaitMap::replies_needed(4), 2);
        assert_eq!(QuorumWaitMap::replies_needed(2), 1);
    }

    #[test]
    fn resolves_after_enough_replicas() {
        let map = QuorumWaitMap::new();
        let waiter = ReplicationWaiter::new();
        map.allocate(1, 2);
        map.set(1, waiter.clone());

        assert_eq!(map.add_replica(1), Some(1));
        assert!(!waiter.is_resolved());
        assert_eq!(map.add_replica(1), Some(0));
        assert_eq!(waiter.wait(Duration::from_millis(10)), WaitOutcome::Replicated);
        assert!(map.is_empty());
    }

    #[test]
    fn acks_before_set_are_not_lost() {
        let map = QuorumWaitMap::new();
        map.allocate(7, 1);
        map.add_replica(7);

        let waiter = ReplicationWaiter::new();
        map.set(7, waiter.clone());
        assert_eq!(waiter.wait(Duration::ZERO), WaitOutcome::Replicated);
        assert!(map.is_empty());
    }

    #[test]
    fn solo_request_needs_no_ack() {
        let map = QuorumWaitMap::new();
        map.allocate(1, 0);
        let waiter = ReplicationWaiter::new();
        map.set(1, waiter.clone());
        assert_eq!(waiter.wait(Duration::ZERO), WaitOutcome::Replicated);
    }

    #[test]
    fn clear_fails_everyone_once() {
        let map = QuorumWaitMap::new();
        let waiters: Vec<_> = (1..=3)
            .map(|i| {
                let w = ReplicationWaiter::new();
                map.allocate(i, 1);
                map.set(i, w.clone());
                w
            })
            .collect();

        assert_eq!(map.clear("no longer leader"), 3);
        for w in &waiters {
            assert_eq!(w.wait(Duration::ZERO), WaitOutcome::Failed("no longer leader".into()));
        }

        // a late ack cannot flip a failed request to success
        assert_eq!(map.add_replica(1), None);
        assert_eq!(waiters[0].wait(Duration::ZERO), WaitOutcome::Failed("no longer leader".into()));
    }

    #[test]
    fn range_acks_only_pending_indexes() {
        let map = QuorumWaitMap::new();
        map.allocate(3, 1);
        map.allocate(5, 2);
        let w3 = ReplicationWaiter::new();
        map.set(3, w3.clone());

        map.add_replica_range(1, 10);

        assert!(w3.is_resolved());
        assert_eq!(map.add_replica(5), Some(0));
    }

    #[test]
    fn wait_times_out_without_acks() {
        let map = QuorumWaitMap::new();
        map.allocate(1, 1);
        let waiter = ReplicationWaiter::new();
        map.set(1, waiter.clone());

        assert_eq!(waiter.wait(Duration::from_millis(20)), WaitOutcome::TimedOut);
        map.remove(1, "timeout");
        assert_eq!(waiter.wait(Duration::ZERO), WaitOutcome::Failed("timeout".into()));
    }

    #[test]
    fn waiter_wakes_from_another_thread() {
        let map = Arc::new(QuorumWaitMap::new());
        map.allocate(1, 1);
        let waiter = ReplicationWaiter::new();
        map.set(1, waiter.clone());

        let acker = {
            let map = map.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                map.add_replica(1);
            })
        };

        assert_eq!(waiter.wait(Duration::from_secs(5)), WaitOutcome::Replicated);
        acker.join().unwrap();
    }
}
