//! # node
//!
//! why: define the raft role/term/vote state and the rules that move it
//! relations: owned by raft/ behind one mutex; uses message.rs for vote requests
//! what: Role enum, PeerProgress, RaftState (vote rule, term adoption, commit tally)

use crate::message::VoteRequest;
use crate::{LogIndex, ServerId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// The four roles a server can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Single-server cluster - no replication, writes apply directly
    Solo,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Passive state - accepts entries and heartbeats, votes when asked
    Follower,
    /// Active state - replicates the log, sends heartbeats
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Self::Follower
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Solo => "SOLO",
            Role::Candidate => "CANDIDATE",
            Role::Follower => "FOLLOWER",
            Role::Leader => "LEADER",
        };
        f.write_str(name)
    }
}

/// Leader-side replication progress of one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProgress {
    /// Next index to send
    pub next_index: LogIndex,
    /// Highest index known to be stored on the follower
    pub match_index: LogIndex,
}

impl PeerProgress {
    pub fn new(last_log_index: LogIndex) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: 0,
        }
    }
}

/// Role, term, vote and per-peer progress of one server
#[derive(Debug)]
pub struct RaftState {
    pub id: ServerId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<ServerId>,
    pub leader_id: Option<ServerId>,
    pub commit_index: LogIndex,
    /// Follower side: highest index known to match the current leader's log
    pub synced_index: LogIndex,
    /// Leader replaying entries it found unapplied; writes wait
    pub reconciling: bool,
    /// Bumped on every role change so stale workers can tell their results are void
    pub epoch: u64,
    /// Every cluster member, this server included
    pub servers: BTreeSet<ServerId>,
    pub progress: BTreeMap<ServerId, PeerProgress>,
    /// When the election timer fires
    pub election_deadline: Instant,
}

impl RaftState {
    pub fn new(id: ServerId, servers: impl IntoIterator<Item = ServerId>, term: Term, voted_for: Option<ServerId>) -> Self {
        let mut servers: BTreeSet<ServerId> = servers.into_iter().collect();
        servers.insert(id);

        let role = if servers.len() == 1 { Role::Solo } else { Role::Follower };
        Self {
            id,
            role,
            term,
            voted_for,
            leader_id: None,
            commit_index: 0,
            synced_index: 0,
            reconciling: false,
            epoch: 0,
            servers,
            progress: BTreeMap::new(),
            election_deadline: Instant::now(),
        }
    }

    pub fn peers(&self) -> Vec<ServerId> {
        self.servers.iter().copied().filter(|s| *s != self.id).collect()
    }

    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// Servers, leader included, that make a majority
    pub fn quorum_size(&self) -> usize {
        self.num_servers() / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Adopt `term` if it is newer. Returns true if the term changed.
    ///
    /// The vote is reset with it: a vote belongs to exactly one term.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }

    /// Vote rule, evaluated after the request's term was observed
    pub fn grants_vote(&self, request: &VoteRequest, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if request.term < self.term || self.role == Role::Solo {
            return false;
        }

        let up_to_date = (request.last_log_term, request.last_log_index) >= (last_log_term, last_log_index);
        let free = match self.voted_for {
            None => true,
            Some(candidate) => candidate == request.candidate_id,
        };

        up_to_date && free
    }

    /// Reset progress of every peer for a new leadership epoch
    pub fn reset_progress(&mut self, last_log_index: LogIndex) {
        self.progress = self
            .peers()
            .into_iter()
            .map(|peer| (peer, PeerProgress::new(last_log_index)))
            .collect();
    }

    /// Highest index stored on a majority, counting the leader's own log
    pub fn quorum_match_index(&self, leader_last_index: LogIndex) -> LogIndex {
        let mut matches: Vec<LogIndex> = self.progress.values().map(|p| p.match_index).collect();
        matches.push(leader_last_index);
        matches.sort_unstable_by(|a, b| b.cmp(a));

        matches
            .get(self.quorum_size() - 1)
            .copied()
            .unwrap_or(0)
    }

    /// Follower-side commit update: `min(leader_commit, synced_index)`, never decreasing
    pub fn update_commit(&mut self, leader_commit: LogIndex) -> LogIndex {
        let candidate = leader_commit.min(self.synced_index);
        if candidate > self.commit_index {
            self.commit_index = candidate;
        }
        self.commit_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(term: Term, candidate_id: ServerId, last_log_index: LogIndex, last_log_term: Term) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftState::new(1, [1, 2, 3], 0, None);
        assert_eq!(node.role, Role::Follower);
        assert_eq!(node.term, 0);
        assert_eq!(node.voted_for, None);
        assert_eq!(node.peers(), vec![2, 3]);
    }

    #[test]
    fn single_server_is_solo() {
        assert_eq!(RaftState::new(1, [], 0, None).role, Role::Solo);
        assert_eq!(RaftState::new(1, [1], 0, None).role, Role::Solo);
    }

    #[test]
    fn quorum_sizes() {
        for (n, q) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (7, 4)] {
            let node = RaftState::new(1, 1..=n, 0, None);
            assert_eq!(node.quorum_size(), q as usize, "n={n}");
        }
    }

    #[test]
    fn higher_term_resets_vote() {
        let mut node = RaftState::new(1, [1, 2, 3], 4, Some(2));
        assert!(!node.observe_term(4));
        assert_eq!(node.voted_for, Some(2));
        assert!(node.observe_term(5));
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn votes_once_per_term() {
        let mut node = RaftState::new(1, [1, 2, 3], 3, None);
        assert!(node.grants_vote(&vote(3, 2, 0, 0), 0, 0));
        node.voted_for = Some(2);

        assert!(node.grants_vote(&vote(3, 2, 0, 0), 0, 0));
        assert!(!node.grants_vote(&vote(3, 3, 0, 0), 0, 0));
    }

    #[test]
    fn rejects_stale_term_and_stale_log() {
        let node = RaftState::new(1, [1, 2, 3], 5, None);
        assert!(!node.grants_vote(&vote(4, 2, 10, 4), 1, 1));

        // lower last term loses even with a longer log
        assert!(!node.grants_vote(&vote(5, 2, 10, 2), 3, 3));
        // same last term, shorter log loses
        assert!(!node.grants_vote(&vote(5, 2, 2, 3), 3, 3));
        assert!(node.grants_vote(&vote(5, 2, 3, 3), 3, 3));
    }

    #[test]
    fn commit_tally_needs_majority() {
        let mut node = RaftState::new(1, [1, 2, 3, 4, 5], 1, None);
        node.reset_progress(10);
        assert_eq!(node.quorum_match_index(10), 0);

        node.progress.get_mut(&2).unwrap().match_index = 8;
        assert_eq!(node.quorum_match_index(10), 0);
        node.progress.get_mut(&3).unwrap().match_index = 6;
        assert_eq!(node.quorum_match_index(10), 6);
    }

    #[test]
    fn even_cluster_tally_counts_leader_once() {
        let mut node = RaftState::new(1, [1, 2, 3, 4], 1, None);
        node.reset_progress(4);
        node.progress.get_mut(&2).unwrap().match_index = 4;
        // leader + one follower is 2 of 4: not a majority
        assert_eq!(node.quorum_match_index(4), 0);
        node.progress.get_mut(&3).unwrap().match_index = 4;
        assert_eq!(node.quorum_match_index(4), 4);
    }

    #[test]
    fn follower_commit_is_bounded_and_monotonic() {
        let mut node = RaftState::new(1, [1, 2, 3], 1, None);
        node.synced_index = 5;

        assert_eq!(node.update_commit(3), 3);
        assert_eq!(node.update_commit(9), 5);
        assert_eq!(node.update_commit(1), 5);
    }
}
