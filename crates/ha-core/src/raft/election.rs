//! # election
//!
//! why: pick one leader per term from the servers holding the most up-to-date log
//! relations: part of RaftManager; persists term and vote through log.rs before any rpc,
//! sends VoteRequest over transport.rs, applies the node.rs vote rule
//! what: request_vote (candidate round), vote (incoming RequestVote)

use super::RaftManager;
use crate::error::Result;
use crate::message::{VoteRequest, VoteResponse};
use crate::node::Role;
use ha_storage::RaftStateRecord;
use tracing::{debug, info};

impl RaftManager {
    /// Run one election round. Returns true if this server won it.
    ///
    /// The new term and the self-vote are persisted before any vote request is
    /// sent. Peers are asked one after another and the round stops as soon as a
    /// majority granted. A lost or split round leaves the server a candidate;
    /// the freshly randomized election deadline is its backoff.
    pub fn request_vote(&self) -> Result<bool> {
        let (term, epoch, request, peers, needed) = {
            let mut st = self.state.lock();
            if matches!(st.role, Role::Leader | Role::Solo) {
                return Ok(false);
            }

            let term = st.term + 1;
            self.log.save_raft_state(RaftStateRecord {
                term,
                voted_for: Some(self.id),
            })?;

            st.role = Role::Candidate;
            st.term = term;
            st.voted_for = Some(self.id);
            st.leader_id = None;
            st.synced_index = 0;
            st.epoch += 1;
            self.reset_election_timer(&mut st);

            let (last_log_index, last_log_term) = self.log.last_index_and_term();
            let request = VoteRequest {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            };
            (term, st.epoch, request, st.peers(), st.quorum_size())
        };

        info!(server_id = self.id, term, "starting election");

        let mut votes = 1;
        for peer in peers {
            let response = match self.transport.request_vote(peer, &request, self.config.rpc_timeout) {
                Ok(response) => response,
                Err(e) => {
                    debug!(server_id = self.id, peer, error = %e, "vote request failed");
                    continue;
                }
            };

            if response.term > term {
                info!(server_id = self.id, peer, term = response.term, "peer has a newer term");
                self.step_down(response.term, None)?;
                return Ok(false);
            }

            {
                let st = self.state.lock();
                if st.role != Role::Candidate || st.epoch != epoch {
                    return Ok(false);
                }
            }

            if response.granted {
                votes += 1;
                debug!(server_id = self.id, peer, votes, needed, "vote granted");
                if votes >= needed {
                    self.become_leader(epoch);
                    return Ok(self.role() == Role::Leader);
                }
            }
        }

        debug!(server_id = self.id, term, votes, needed, "election not won");
        Ok(false)
    }

    /// Answer a vote request.
    ///
    /// A newer term is adopted first (stepping down if needed). The vote is
    /// granted only when it is free for this term and the candidate's log is at
    /// least as up to date; a granted vote is persisted before replying.
    pub(super) fn vote(&self, request: &VoteRequest) -> Result<VoteResponse> {
        let (response, was_leader) = {
            let mut st = self.state.lock();
            if st.role == Role::Solo {
                return Ok(VoteResponse {
                    granted: false,
                    term: st.term,
                });
            }

            let mut was_leader = false;
            let term_changed = st.observe_term(request.term);
            if term_changed && st.role != Role::Follower {
                was_leader = self.demote(&mut st, None);
            }

            let (last_log_index, last_log_term) = self.log.last_index_and_term();
            let granted = st.grants_vote(request, last_log_index, last_log_term);
            if granted {
                st.voted_for = Some(request.candidate_id);
                self.reset_election_timer(&mut st);
            }
            if granted || term_changed {
                self.persist(&st)?;
            }

            debug!(
                server_id = self.id,
                candidate = request.candidate_id,
                term = st.term,
                granted,
                "handled vote request"
            );
            (
                VoteResponse {
                    granted,
                    term: st.term,
                },
                was_leader,
            )
        };

        self.after_demote(was_leader);
        Ok(response)
    }
}
