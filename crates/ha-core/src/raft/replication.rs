//! # replication
//!
//! why: get every write onto a majority before it is applied, and keep followers in step
//! relations: part of RaftManager; waits on quorum.rs, queues replica.rs workers,
//! sends AppendRequest over transport.rs
//! what: write, commit_through, replicate_log, per-peer replicate/heartbeat, reconcile

use super::RaftManager;
use crate::error::{HaError, Result};
use crate::log::Federation;
use crate::message::AppendRequest;
use crate::node::Role;
use crate::quorum::{QuorumWaitMap, ReplicationWaiter, WaitOutcome};
use crate::{LogIndex, ServerId};
use tracing::{debug, info, warn};

impl RaftManager {
    /// Append `command` and block until a majority stores it, then apply it.
    ///
    /// Followers answer `NotLeader`; a leader still reconciling answers
    /// `Reconciling`. A SOLO server applies straight away.
    pub fn write(&self, command: &str, federation: Federation) -> Result<LogIndex> {
        let (index, waiter) = {
            let st = self.state.lock();
            let role = st.role;
            match role {
                Role::Solo => {
                    let index = self.log.append(st.term, command, false, federation)?;
                    drop(st);
                    return self.commit_through(index).map(|_| index);
                }
                Role::Leader if st.reconciling => return Err(HaError::Reconciling),
                Role::Leader => {}
                Role::Follower | Role::Candidate => {
                    return Err(HaError::NotLeader { leader: st.leader_id })
                }
            }

            // the request exists before the entry is visible to the workers
            let index = self.log.next_index();
            self.quorum
                .allocate(index, QuorumWaitMap::replies_needed(st.num_servers()));
            let waiter = ReplicationWaiter::new();
            self.quorum.set(index, waiter.clone());

            if let Err(e) = self.log.append(st.term, command, false, federation) {
                self.quorum.remove(index, "append failed");
                return Err(e);
            }
            (index, waiter)
        };

        self.replicate_log(index);

        match waiter.wait(self.config.quorum_timeout) {
            WaitOutcome::Replicated => {
                self.commit_through(index)?;
                Ok(index)
            }
            WaitOutcome::Failed(reason) => Err(HaError::QuorumFailed { index, reason }),
            WaitOutcome::TimedOut => {
                self.quorum.remove(index, "quorum timeout");
                warn!(server_id = self.id, index, "write not replicated in time");
                Err(HaError::QuorumTimeout {
                    index,
                    timeout: self.config.quorum_timeout,
                })
            }
        }
    }

    /// Raise the commit index to at least `index` and apply up to it
    fn commit_through(&self, index: LogIndex) -> Result<()> {
        let commit = {
            let mut st = self.state.lock();
            if index > st.commit_index {
                st.commit_index = index;
            }
            st.commit_index
        };

        let before = self.log.last_applied();
        let result = match self.log.apply_up_to(commit) {
            // a later entry failing is not this writer's concern
            Err(HaError::Apply { index: failed, .. }) if failed > index => Ok(()),
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        };
        self.notify_applied(before);
        result
    }

    /// Wake the replication worker of every peer
    pub fn replicate_log(&self, index: LogIndex) {
        let peers = self.state.lock().peers();
        if let Some(pools) = self.leader_pools() {
            debug!(server_id = self.id, index, peers = peers.len(), "replicating");
            for peer in peers {
                pools.replication.add_request(peer);
            }
        }
    }

    pub(super) fn send_heartbeats(&self) {
        let peers = self.state.lock().peers();
        if let Some(pools) = self.leader_pools() {
            for peer in peers {
                pools.heartbeat.add_request(peer);
            }
        }
    }

    fn queue_replication(&self, peer: ServerId, epoch: u64) {
        if let Some(pools) = self.leader_pools() {
            if pools.epoch == epoch {
                pools.replication.add_request(peer);
            }
        }
    }

    /// Replication worker callback: send `peer` the entry at its next index
    pub(super) fn replicate_to(&self, peer: ServerId) -> Result<()> {
        let (epoch, term, commit, next) = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return Ok(());
            }
            let Some(progress) = st.progress.get(&peer) else {
                return Ok(());
            };
            (st.epoch, st.term, st.commit_index, progress.next_index)
        };

        if next > self.log.last_index() {
            return Ok(());
        }

        let (entry, _) = self.log.get(next).map_err(|e| {
            warn!(server_id = self.id, peer, index = next, "entry needed by follower was purged");
            e
        })?;

        let request = AppendRequest::entry(self.id, term, commit, &entry);
        let response = self.transport.append_log(peer, &request, self.config.rpc_timeout)?;

        if response.success {
            self.replicate_success(peer, epoch, entry.index);
            Ok(())
        } else if response.term > term {
            info!(server_id = self.id, peer, term = response.term, "follower has a newer term");
            self.step_down(response.term, None)
        } else if self.replicate_failure(peer, epoch, entry.index) {
            Ok(())
        } else {
            Err(HaError::LogMismatch {
                index: entry.index,
                expected: entry.prev_term,
                found: None,
            })
        }
    }

    /// `peer` stores everything up to `index`: advance its progress, count
    /// acks for pending writes and move the commit index. Queues more work
    /// when the peer is still behind.
    pub(super) fn replicate_success(&self, peer: ServerId, epoch: u64, index: LogIndex) {
        let behind = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.role != Role::Leader {
                return;
            }
            let (last_index, _) = self.log.last_index_and_term();
            let Some(progress) = st.progress.get_mut(&peer) else {
                return;
            };

            let previous = progress.match_index;
            if index > previous {
                progress.match_index = index;
                self.quorum.add_replica_range(previous + 1, index);
            }
            progress.next_index = progress.next_index.max(index + 1);
            let behind = progress.next_index <= last_index;

            // entries of earlier terms only commit through a current-term entry
            let candidate = st.quorum_match_index(last_index);
            if candidate > st.commit_index && self.log.term_at(candidate) == Some(st.term) {
                debug!(server_id = self.id, commit = candidate, "commit index advanced");
                st.commit_index = candidate;
            }
            behind
        };

        if behind {
            self.queue_replication(peer, epoch);
        }
    }

    /// `peer` rejected the entry at `index`: step its next index back.
    /// Returns false when it cannot move back any further.
    pub(super) fn replicate_failure(&self, peer: ServerId, epoch: u64, index: LogIndex) -> bool {
        let moved = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.role != Role::Leader {
                return true;
            }
            let Some(progress) = st.progress.get_mut(&peer) else {
                return true;
            };

            let floor = progress.match_index + 1;
            let next = index.saturating_sub(1).max(floor).max(1);
            let moved = next < progress.next_index;
            progress.next_index = next.min(progress.next_index);

            debug!(server_id = self.id, peer, rejected = index, next_index = progress.next_index, "follower rejected entry");
            moved
        };

        if moved {
            self.queue_replication(peer, epoch);
        } else {
            warn!(server_id = self.id, peer, index, "follower refuses entry at its match frontier");
        }
        moved
    }

    /// Heartbeat worker callback: probe `peer` with the leader's last entry
    pub(super) fn heartbeat_to(&self, peer: ServerId) -> Result<()> {
        let (epoch, term, commit) = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return Ok(());
            }
            (st.epoch, st.term, st.commit_index)
        };

        let (last_index, last_term) = self.log.last_index_and_term();
        let request = AppendRequest::heartbeat(self.id, term, commit, last_index, last_term);
        let response = self.transport.append_log(peer, &request, self.config.rpc_timeout)?;

        if response.term > term {
            info!(server_id = self.id, peer, term = response.term, "heartbeat answered with a newer term");
            return self.step_down(response.term, None);
        }

        if response.success {
            self.replicate_success(peer, epoch, last_index);
            return Ok(());
        }

        // the follower lacks our last entry: walk its next index back once per beat
        let lagging = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.role != Role::Leader {
                return Ok(());
            }
            match st.progress.get_mut(&peer) {
                Some(progress) => {
                    progress.next_index = progress.next_index.min(last_index + 1);
                    if progress.next_index > progress.match_index + 1 {
                        progress.next_index -= 1;
                    }
                    true
                }
                None => false,
            }
        };

        if lagging {
            self.queue_replication(peer, epoch);
        }
        Ok(())
    }

    /// Re-replicate `from..=to`, found unapplied at election, one index at a
    /// time; each is committed and applied once a majority holds it.
    pub(super) fn reconcile(&self, epoch: u64, from: LogIndex, to: LogIndex) {
        info!(server_id = self.id, from, to, "reconciling unapplied log tail");

        for index in from..=to {
            loop {
                let waiter = {
                    let st = self.state.lock();
                    if st.epoch != epoch || st.role != Role::Leader {
                        return;
                    }

                    let acked = st.progress.values().filter(|p| p.match_index >= index).count();
                    let needed = QuorumWaitMap::replies_needed(st.num_servers()).saturating_sub(acked);
                    self.quorum.allocate(index, needed);
                    let waiter = ReplicationWaiter::new();
                    self.quorum.set(index, waiter.clone());
                    waiter
                };

                self.replicate_log(index);
                match waiter.wait(self.config.quorum_timeout) {
                    WaitOutcome::Replicated => break,
                    WaitOutcome::Failed(reason) => {
                        debug!(server_id = self.id, index, %reason, "reconciliation aborted");
                        return;
                    }
                    WaitOutcome::TimedOut => {
                        self.quorum.remove(index, "reconciliation timeout");
                        warn!(server_id = self.id, index, "reconciliation waiting for quorum");
                    }
                }
            }

            let commit = {
                let mut st = self.state.lock();
                if st.epoch != epoch || st.role != Role::Leader {
                    return;
                }
                st.commit_index = st.commit_index.max(index);
                st.commit_index
            };

            if let Err(e) = self.apply_committed(commit) {
                warn!(server_id = self.id, index, error = %e, "cannot apply reconciled entry");
            }
        }

        let mut st = self.state.lock();
        if st.epoch == epoch && st.role == Role::Leader {
            st.reconciling = false;
            info!(server_id = self.id, term = st.term, "reconciliation complete, accepting writes");
        }
    }
}
