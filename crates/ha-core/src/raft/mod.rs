//! # raft
//!
//! why: keep exactly one writer per term and a log replicated to a majority before it is applied
//! relations: drives log.rs, quorum.rs and two replica.rs pools; talks to peers through transport.rs;
//! notifies federation.rs of leadership changes and apply progress
//! what: RaftManager (lifecycle, timers, role transitions, membership, status), RoleListener

mod election;
mod follower;
mod replication;

use crate::config::HaConfig;
use crate::error::{HaError, Result};
use crate::log::LogStore;
use crate::node::{PeerProgress, RaftState, Role};
use crate::quorum::QuorumWaitMap;
use crate::replica::{ReplicaPool, RetryPolicy};
use crate::transport::PeerTransport;
use crate::{LogIndex, ServerId, Term};
use ha_storage::RaftStateRecord;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Components that follow this server's leadership
pub trait RoleListener: Send + Sync {
    fn on_leader(&self);
    fn on_follower(&self);

    /// The state machine advanced to `last_applied`
    fn on_applied(&self, _last_applied: LogIndex) {}
}

/// Read-only snapshot for operational introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub server_id: ServerId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<ServerId>,
    pub leader_id: Option<ServerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub last_federated_index: Option<LogIndex>,
    pub reconciling: bool,
}

/// Worker pools that only exist while leading, tagged with the leadership epoch
struct LeaderPools {
    epoch: u64,
    replication: ReplicaPool<ServerId>,
    heartbeat: ReplicaPool<ServerId>,
}

impl LeaderPools {
    fn finalize(&self) {
        self.replication.finalize();
        self.heartbeat.finalize();
    }
}

/// Leader election and log replication for one server.
///
/// Lock order: `pools` before `state`, `state` before the log store and the
/// quorum map. No lock is held across an rpc.
pub struct RaftManager {
    id: ServerId,
    config: HaConfig,
    log: Arc<LogStore>,
    transport: Arc<dyn PeerTransport>,
    quorum: QuorumWaitMap,
    state: Mutex<RaftState>,
    pools: Mutex<Option<Arc<LeaderPools>>>,
    listeners: Mutex<Vec<Weak<dyn RoleListener>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    stopped: Mutex<bool>,
    stop_cond: Condvar,
    me: Weak<RaftManager>,
}

impl RaftManager {
    /// Build the manager from the persisted `{term, voted_for}` record.
    ///
    /// Nothing runs until [`RaftManager::start`].
    pub fn new(config: &HaConfig, log: Arc<LogStore>, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let persisted = log.raft_state();
        let servers = config.servers.iter().map(|s| s.id);
        let mut state = RaftState::new(config.server_id, servers, persisted.term, persisted.voted_for);
        state.commit_index = log.last_applied();

        Arc::new_cyclic(|me| Self {
            id: config.server_id,
            config: config.clone(),
            log,
            transport,
            quorum: QuorumWaitMap::new(),
            state: Mutex::new(state),
            pools: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            stopped: Mutex::new(false),
            stop_cond: Condvar::new(),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    pub fn add_listener(&self, listener: Weak<dyn RoleListener>) {
        self.listeners.lock().push(listener);
    }

    /// Start the timer thread. A SOLO server applies any unapplied tail first.
    pub fn start(&self) -> Result<()> {
        let solo = {
            let mut st = self.state.lock();
            self.reset_election_timer(&mut st);
            if st.role == Role::Solo {
                st.commit_index = self.log.last_index();
                st.leader_id = Some(self.id);
            }
            st.role == Role::Solo
        };

        if solo {
            self.apply_committed(self.log.last_index())?;
            info!(server_id = self.id, "running as SOLO server");
            self.notify(true);
        }

        let me = self.me.clone();
        let handle = thread::Builder::new()
            .name(format!("raft-timer-{}", self.id))
            .spawn(move || run_timer(me))?;
        *self.timer.lock() = Some(handle);
        Ok(())
    }

    /// Stop timers and workers; outstanding writers fail
    pub fn shutdown(&self) {
        *self.stopped.lock() = true;
        self.stop_cond.notify_all();

        if let Some(handle) = self.timer.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        {
            let mut st = self.state.lock();
            st.epoch += 1;
            st.reconciling = false;
        }
        self.quorum.clear("server shutting down");

        let pools = self.pools.lock().take();
        if let Some(pools) = pools {
            pools.finalize();
        }
        info!(server_id = self.id, "raft manager stopped");
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn term(&self) -> Term {
        self.state.lock().term
    }

    pub fn leader_id(&self) -> Option<ServerId> {
        self.state.lock().leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().commit_index
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role(), Role::Leader | Role::Solo)
    }

    pub fn is_reconciling(&self) -> bool {
        self.state.lock().reconciling
    }

    /// Progress of `peer`, leader only
    pub fn peer_progress(&self, peer: ServerId) -> Option<PeerProgress> {
        self.state.lock().progress.get(&peer).copied()
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.state.lock();
        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        RaftStatus {
            server_id: self.id,
            role: st.role,
            term: st.term,
            voted_for: st.voted_for,
            leader_id: st.leader_id,
            commit_index: st.commit_index,
            last_applied: self.log.last_applied(),
            last_log_index,
            last_log_term,
            last_federated_index: self.log.last_federated(),
            reconciling: st.reconciling,
        }
    }

    // -- state transitions --

    fn persist(&self, st: &RaftState) -> Result<()> {
        self.log.save_raft_state(RaftStateRecord {
            term: st.term,
            voted_for: st.voted_for,
        })
    }

    fn reset_election_timer(&self, st: &mut RaftState) {
        let base = self.config.election_timeout;
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        st.election_deadline = Instant::now() + base + Duration::from_millis(jitter_ms);
    }

    /// Turn into a follower under the state lock. Returns true if this server was leading.
    ///
    /// The caller finishes with [`RaftManager::after_demote`] once the lock is released.
    fn demote(&self, st: &mut RaftState, leader: Option<ServerId>) -> bool {
        let was_leader = st.role == Role::Leader;

        st.role = Role::Follower;
        st.leader_id = leader;
        st.reconciling = false;
        st.synced_index = 0;
        st.epoch += 1;
        st.progress.clear();
        self.reset_election_timer(st);

        let failed = self.quorum.clear("no longer leader");
        if was_leader {
            warn!(server_id = self.id, term = st.term, failed_writes = failed, "stepped down to follower");
        }
        was_leader
    }

    fn after_demote(&self, was_leader: bool) {
        if was_leader {
            self.stop_stale_pools();
            self.notify(false);
        }
    }

    /// Step down to follower, adopting `term` if it is newer
    pub fn step_down(&self, term: Term, leader: Option<ServerId>) -> Result<()> {
        let was_leader = {
            let mut st = self.state.lock();
            if st.role == Role::Solo {
                return Ok(());
            }
            if st.observe_term(term) {
                self.persist(&st)?;
            }
            self.demote(&mut st, leader)
        };

        self.after_demote(was_leader);
        Ok(())
    }

    /// Enter leadership for the election held in `epoch`
    fn become_leader(&self, epoch: u64) {
        let (epoch, peers, tail) = {
            let mut st = self.state.lock();
            if st.role != Role::Candidate || st.epoch != epoch {
                return;
            }

            let last_index = self.log.last_index();
            let last_applied = self.log.last_applied();

            st.role = Role::Leader;
            st.leader_id = Some(self.id);
            st.epoch += 1;
            st.reset_progress(last_index);
            st.commit_index = last_applied;
            st.reconciling = last_applied < last_index;

            info!(server_id = self.id, term = st.term, last_index, last_applied, "became leader");
            let tail = st.reconciling.then_some((last_applied + 1, last_index));
            (st.epoch, st.peers(), tail)
        };

        self.install_pools(epoch, &peers);
        self.send_heartbeats();
        self.notify(true);

        if let Some((from, to)) = tail {
            let me = self.me.clone();
            let spawned = thread::Builder::new()
                .name(format!("raft-reconcile-{}", self.id))
                .spawn(move || {
                    if let Some(manager) = me.upgrade() {
                        manager.reconcile(epoch, from, to);
                    }
                });
            if let Err(e) = spawned {
                error!(server_id = self.id, error = %e, "cannot spawn reconciliation");
            }
        }
    }

    fn install_pools(&self, epoch: u64, peers: &[ServerId]) {
        let stale = {
            let mut slot = self.pools.lock();
            let current = {
                let st = self.state.lock();
                st.role == Role::Leader && st.epoch == epoch
            };

            let stale = slot.take();
            if current {
                let pools = self.new_pools(epoch);
                for peer in peers {
                    pools.replication.start_worker(*peer);
                    pools.heartbeat.start_worker(*peer);
                }
                *slot = Some(Arc::new(pools));
            }
            stale
        };

        if let Some(stale) = stale {
            stale.finalize();
        }
    }

    fn new_pools(&self, epoch: u64) -> LeaderPools {
        let retry = RetryPolicy::new(self.config.replica_retry_floor, self.config.replica_retry_max);

        let me = self.me.clone();
        let replication = ReplicaPool::new("raft-replica", retry, move |peer: ServerId| match me.upgrade() {
            Some(manager) => manager.replicate_to(peer),
            None => Ok(()),
        });

        let me = self.me.clone();
        let heartbeat = ReplicaPool::new("raft-heartbeat", retry, move |peer: ServerId| match me.upgrade() {
            Some(manager) => manager.heartbeat_to(peer),
            None => Ok(()),
        });

        LeaderPools {
            epoch,
            replication,
            heartbeat,
        }
    }

    /// Stop pools that do not belong to the current leadership, joining their workers
    fn stop_stale_pools(&self) {
        let stale = {
            let mut slot = self.pools.lock();
            let current = {
                let st = self.state.lock();
                (st.role == Role::Leader).then_some(st.epoch)
            };
            match slot.as_ref() {
                Some(pools) if Some(pools.epoch) != current => slot.take(),
                _ => None,
            }
        };

        if let Some(stale) = stale {
            stale.finalize();
        }
    }

    fn leader_pools(&self) -> Option<Arc<LeaderPools>> {
        self.pools.lock().clone()
    }

    fn notify(&self, leader: bool) {
        for listener in self.live_listeners() {
            if leader {
                listener.on_leader();
            } else {
                listener.on_follower();
            }
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn RoleListener>> {
        self.listeners.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Tell listeners about progress when an apply moved past `before`
    fn notify_applied(&self, before: LogIndex) {
        let applied = self.log.last_applied();
        if applied > before {
            for listener in self.live_listeners() {
                listener.on_applied(applied);
            }
        }
    }

    // -- membership --

    /// Add a server to the cluster; a leader starts replicating to it at once
    pub fn add_server(&self, id: ServerId) -> Result<()> {
        let leading = {
            let mut st = self.state.lock();
            if !st.servers.insert(id) {
                return Ok(());
            }

            if st.role == Role::Solo {
                st.role = Role::Follower;
                st.leader_id = None;
                st.epoch += 1;
                self.reset_election_timer(&mut st);
            }

            info!(server_id = self.id, peer = id, servers = st.num_servers(), "server added");
            if st.role == Role::Leader {
                st.progress.insert(id, PeerProgress::new(self.log.last_index()));
                Some(st.epoch)
            } else {
                None
            }
        };

        if let (Some(epoch), Some(pools)) = (leading, self.leader_pools()) {
            if pools.epoch == epoch {
                pools.replication.start_worker(id);
                pools.heartbeat.add_request(id);
            }
        }
        Ok(())
    }

    /// Remove a server; a cluster shrunk to this server alone becomes SOLO
    pub fn delete_server(&self, id: ServerId) -> Result<()> {
        if id == self.id {
            return Err(HaError::config("a server cannot remove itself"));
        }

        let (became_solo, was_leader) = {
            let mut st = self.state.lock();
            if !st.servers.remove(&id) {
                return Err(HaError::UnknownServer(id));
            }
            st.progress.remove(&id);
            info!(server_id = self.id, peer = id, servers = st.num_servers(), "server removed");

            if st.num_servers() == 1 {
                let was_leader = st.role == Role::Leader;
                st.role = Role::Solo;
                st.leader_id = Some(self.id);
                st.reconciling = false;
                st.epoch += 1;
                st.progress.clear();
                st.commit_index = st.commit_index.max(self.log.last_index());
                self.quorum.clear("cluster reconfigured");
                (true, was_leader)
            } else {
                (false, false)
            }
        };

        if became_solo {
            self.stop_stale_pools();
            self.apply_committed(self.log.last_index())?;
            if !was_leader {
                self.notify(true);
            }
        } else if let Some(pools) = self.leader_pools() {
            pools.replication.stop_worker(id);
            pools.heartbeat.stop_worker(id);
        }
        Ok(())
    }

    // -- timers --

    /// Evaluate election/heartbeat/purge deadlines once
    fn tick(&self, now: Instant, next_heartbeat: &mut Instant, next_purge: &mut Instant) -> Result<()> {
        enum Due {
            Election,
            Heartbeat,
            Nothing,
        }

        let due = {
            let st = self.state.lock();
            match st.role {
                Role::Follower | Role::Candidate if now >= st.election_deadline => Due::Election,
                Role::Leader if now >= *next_heartbeat => Due::Heartbeat,
                _ => Due::Nothing,
            }
        };

        match due {
            Due::Election => {
                self.request_vote()?;
            }
            Due::Heartbeat => {
                *next_heartbeat = now + self.config.heartbeat_interval;
                self.send_heartbeats();
                self.catch_up_apply()?;
            }
            Due::Nothing => {}
        }

        if now >= *next_purge {
            *next_purge = now + self.config.purge_period;
            self.purge()?;
        }
        Ok(())
    }

    /// Drop applied entries outside the retention windows
    pub fn purge(&self) -> Result<usize> {
        let batch = self.config.purge_batch_size;
        let plain = self.log.purge(self.config.log_retention, batch)?;
        let federated = self.log.purge_federated(self.config.federated_log_retention, batch)?;

        if plain + federated > 0 {
            info!(server_id = self.id, plain, federated, "purged log");
        }
        Ok(plain + federated)
    }

    /// Apply up to `commit`; a state machine rejection is logged and retried later
    fn apply_committed(&self, commit: LogIndex) -> Result<()> {
        let before = self.log.last_applied();
        let result = match self.log.apply_up_to(commit) {
            Ok(_) | Err(HaError::Apply { .. }) => Ok(()),
            Err(e) => Err(e),
        };
        self.notify_applied(before);
        result
    }

    fn catch_up_apply(&self) -> Result<()> {
        let commit = {
            let st = self.state.lock();
            if st.reconciling {
                return Ok(());
            }
            st.commit_index
        };

        if commit > self.log.last_applied() {
            self.apply_committed(commit)?;
        }
        Ok(())
    }
}

fn run_timer(me: Weak<RaftManager>) {
    let (period, purge_period, id) = match me.upgrade() {
        Some(manager) => (manager.config.timer_period, manager.config.purge_period, manager.id),
        None => return,
    };

    let mut next_heartbeat = Instant::now();
    let mut next_purge = Instant::now() + purge_period;

    loop {
        let Some(manager) = me.upgrade() else {
            return;
        };

        {
            let mut stopped = manager.stopped.lock();
            if !*stopped {
                manager.stop_cond.wait_for(&mut stopped, period);
            }
            if *stopped {
                debug!(server_id = id, "raft timer exiting");
                return;
            }
        }

        if let Err(e) = manager.tick(Instant::now(), &mut next_heartbeat, &mut next_purge) {
            error!(server_id = id, error = %e, "raft timer action failed");
        }
    }
}
