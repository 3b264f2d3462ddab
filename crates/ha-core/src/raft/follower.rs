//! # follower
//!
//! why: accept the leader's entries and heartbeats and follow its commit index
//! relations: part of RaftManager; stores entries through log.rs, serves transport.rs PeerHandler
//! what: accept_append, update_commit, PeerHandler impl

use super::RaftManager;
use crate::error::{HaError, Result};
use crate::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::node::Role;
use crate::transport::PeerHandler;
use crate::LogIndex;
use tracing::{debug, error, info};

impl RaftManager {
    /// Follower-side commit: `min(leader_commit, synced_index)`, then apply
    pub fn update_commit(&self, leader_commit: LogIndex) -> Result<LogIndex> {
        let commit = self.state.lock().update_commit(leader_commit);
        self.apply_committed(commit)?;
        Ok(commit)
    }

    fn accept_append(&self, request: &AppendRequest) -> Result<AppendResponse> {
        let mut was_leader = false;

        let (success, term) = {
            let mut st = self.state.lock();
            if st.role == Role::Solo || request.leader_term < st.term {
                return Ok(AppendResponse {
                    success: false,
                    term: st.term,
                });
            }

            let term_changed = st.observe_term(request.leader_term);
            if term_changed {
                self.persist(&st)?;
            }

            if st.role != Role::Follower {
                was_leader = self.demote(&mut st, Some(request.leader_id));
            } else if term_changed || st.leader_id != Some(request.leader_id) {
                info!(server_id = self.id, leader = request.leader_id, term = st.term, "following new leader");
                st.leader_id = Some(request.leader_id);
                st.synced_index = 0;
            }
            self.reset_election_timer(&mut st);

            let success = if request.is_heartbeat() {
                let holds = self.log.matches(request.prev_index, request.prev_term);
                if holds {
                    st.synced_index = st.synced_index.max(request.prev_index);
                }
                holds
            } else {
                self.store(request, &mut st.synced_index)?
            };

            st.update_commit(request.leader_commit);
            (success, st.term)
        };

        self.after_demote(was_leader);

        let commit = self.state.lock().commit_index;
        if commit > self.log.last_applied() {
            self.apply_committed(commit)?;
        }

        Ok(AppendResponse { success, term })
    }

    /// Check and store one replicated entry. Mismatches are a negative answer,
    /// not an error; storage failures propagate.
    fn store(&self, request: &AppendRequest, synced_index: &mut LogIndex) -> Result<bool> {
        let entry = request.to_entry();
        let index = entry.index;

        match self.log.check_consistency(&entry) {
            Ok(()) => {}
            Err(HaError::LogMismatch { expected, found, .. }) => {
                debug!(server_id = self.id, index, expected, ?found, "rejecting entry: predecessor mismatch");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        match self.log.put(entry, true) {
            Ok(()) => {
                *synced_index = (*synced_index).max(index);
                Ok(true)
            }
            Err(HaError::AppliedConflict { index }) => {
                error!(server_id = self.id, index, "leader entry conflicts with an applied entry");
                Ok(false)
            }
            Err(HaError::LogMismatch { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl PeerHandler for RaftManager {
    fn handle_request_vote(&self, request: &VoteRequest) -> Result<VoteResponse> {
        self.vote(request)
    }

    /// Store one entry from the leader, or answer a heartbeat probe.
    ///
    /// A heartbeat succeeds iff this log holds the leader's last entry.
    fn handle_append_log(&self, request: &AppendRequest) -> Result<AppendResponse> {
        self.accept_append(request)
    }
}
