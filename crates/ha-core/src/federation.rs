//! # federation
//!
//! why: forward committed federated entries to child zones, each at its own pace
//! relations: reads the federated index space of log.rs, pushes through transport.rs ZoneTransport with a
//! replica.rs pool, follows raft/ leadership as a RoleListener; a slave zone writes through LogWriter
//! what: FederationManager (master push, slave apply_log_record), ZoneCursor, LogWriter

use crate::config::{FederationMode, HaConfig};
use crate::error::{HaError, Result};
use crate::log::{Federation, LogStore};
use crate::message::{FederatedRequest, FederatedResponse};
use crate::raft::{RaftManager, RoleListener};
use crate::replica::{ReplicaPool, RetryPolicy};
use crate::transport::{ZoneHandler, ZoneTransport};
use crate::{LogIndex, ZoneId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a slave zone's received entries go: through its own cluster's write path
pub trait LogWriter: Send + Sync {
    fn write_federated(&self, command: &str, federated_index: LogIndex) -> Result<LogIndex>;
}

impl LogWriter for RaftManager {
    fn write_federated(&self, command: &str, federated_index: LogIndex) -> Result<LogIndex> {
        self.write(command, Federation::Replica(federated_index))
    }
}

/// Push progress of one child zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneCursor {
    pub zone_id: ZoneId,
    /// federated index the next push starts from
    pub next_federated_index: LogIndex,
    pub last_acked_index: Option<LogIndex>,
}

impl ZoneCursor {
    fn new(zone_id: ZoneId, next_federated_index: LogIndex) -> Self {
        Self {
            zone_id,
            next_federated_index,
            last_acked_index: None,
        }
    }
}

/// Federation for one server of a zone.
///
/// On a master zone the leader runs one push worker per child zone. On a
/// slave zone every server accepts pushes, but only the leader can write them.
pub struct FederationManager {
    mode: FederationMode,
    zone_id: ZoneId,
    zones: Vec<ZoneId>,
    rpc_timeout: Duration,
    retry: RetryPolicy,
    log: Arc<LogStore>,
    writer: Arc<dyn LogWriter>,
    transport: Option<Arc<dyn ZoneTransport>>,
    cursors: Mutex<BTreeMap<ZoneId, ZoneCursor>>,
    pool: Mutex<Option<Arc<ReplicaPool<ZoneId>>>>,
    /// serializes apply_log_record on a slave
    apply_lock: Mutex<()>,
    me: Weak<FederationManager>,
}

impl FederationManager {
    pub fn new(
        config: &HaConfig,
        log: Arc<LogStore>,
        writer: Arc<dyn LogWriter>,
        transport: Option<Arc<dyn ZoneTransport>>,
    ) -> Result<Arc<Self>> {
        let federation = &config.federation;
        if federation.mode == FederationMode::Master && transport.is_none() {
            return Err(HaError::config("federation master needs a zone transport"));
        }

        Ok(Arc::new_cyclic(|me| Self {
            mode: federation.mode,
            zone_id: federation.zone_id,
            zones: federation.zones.iter().map(|z| z.id).collect(),
            rpc_timeout: config.rpc_timeout,
            retry: RetryPolicy::new(config.replica_retry_floor, config.replica_retry_max),
            log,
            writer,
            transport,
            cursors: Mutex::new(BTreeMap::new()),
            pool: Mutex::new(None),
            apply_lock: Mutex::new(()),
            me: me.clone(),
        }))
    }

    pub fn mode(&self) -> FederationMode {
        self.mode
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    pub fn cursor(&self, zone: ZoneId) -> Option<ZoneCursor> {
        self.cursors.lock().get(&zone).copied()
    }

    pub fn cursors(&self) -> Vec<ZoneCursor> {
        self.cursors.lock().values().copied().collect()
    }

    /// Start pushing to every child zone. Master zones only.
    pub fn start(&self) {
        if self.mode != FederationMode::Master {
            return;
        }

        let start_from = self.log.last_federated().unwrap_or(0);
        {
            let mut cursors = self.cursors.lock();
            cursors.clear();
            for zone in &self.zones {
                cursors.insert(*zone, ZoneCursor::new(*zone, start_from));
            }
        }

        let me = self.me.clone();
        let pool = Arc::new(ReplicaPool::new("federation", self.retry, move |zone: ZoneId| match me.upgrade() {
            Some(manager) => manager.replicate_zone(zone),
            None => Ok(()),
        }));

        let stale = self.pool.lock().replace(pool.clone());
        if let Some(stale) = stale {
            stale.finalize();
        }
        for zone in &self.zones {
            pool.add_request(*zone);
        }
        info!(zone_id = self.zone_id, zones = self.zones.len(), start_from, "federation started");
    }

    /// Stop every push worker and forget the cursors
    pub fn stop(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.finalize();
            self.cursors.lock().clear();
            info!(zone_id = self.zone_id, "federation stopped");
        }
    }

    /// Wake the push worker of every zone
    pub fn replicate(&self) {
        let pool = self.pool.lock().clone();
        if let Some(pool) = pool {
            pool.add_request_all();
        }
    }

    /// Worker callback: push the next committed federated entry to `zone`
    fn replicate_zone(&self, zone: ZoneId) -> Result<()> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        let Some(cursor) = self.cursor(zone) else {
            return Ok(());
        };

        let Some(entry) = self.log.get_federated_from(cursor.next_federated_index) else {
            return Ok(());
        };
        // only committed entries leave the zone; the backoff polls until it applies
        let applied = self.log.last_applied();
        if entry.index > applied {
            return Err(HaError::NotCommitted {
                index: entry.index,
                applied,
            });
        }
        let Some(index) = entry.federated_index else {
            return Ok(());
        };

        let request = FederatedRequest {
            index,
            prev_index: self.log.previous_federated(index),
            command: entry.command,
        };
        let response = transport.federated_replicate(zone, &request, self.rpc_timeout)?;

        if response.success {
            self.replicate_success(zone, index);
            Ok(())
        } else {
            self.replicate_failure(zone, index, response.last_known_index)
        }
    }

    /// `zone` stores federated entries up to `index`
    pub fn replicate_success(&self, zone: ZoneId, index: LogIndex) {
        {
            let mut cursors = self.cursors.lock();
            let Some(cursor) = cursors.get_mut(&zone) else {
                return;
            };
            cursor.last_acked_index = Some(index);
            cursor.next_federated_index = index + 1;
        }
        debug!(zone, index, "federated entry acknowledged");

        if self.log.next_federated(index).is_some() {
            let pool = self.pool.lock().clone();
            if let Some(pool) = pool {
                pool.add_request(zone);
            }
        }
    }

    /// `zone` refused `index` and reported its own last federated index.
    ///
    /// The cursor rewinds to the entry right after what the zone holds; the
    /// returned error hands the retry to the worker's backoff.
    pub fn replicate_failure(&self, zone: ZoneId, index: LogIndex, last_known: Option<LogIndex>) -> Result<()> {
        let next = last_known.map_or(0, |known| known + 1);
        {
            let mut cursors = self.cursors.lock();
            let Some(cursor) = cursors.get_mut(&zone) else {
                return Ok(());
            };
            cursor.next_federated_index = next;
            cursor.last_acked_index = last_known;
        }
        warn!(zone, rejected = index, ?last_known, next, "zone rejected federated entry, rewinding");

        // the entry after the zone's last one must chain onto it
        if let Some(entry) = self.log.get_federated_from(next) {
            let fed = entry.federated_index.unwrap_or(next);
            if self.log.previous_federated(fed) != last_known {
                return Err(HaError::FederationGap { index: next });
            }
        }

        Err(HaError::FederationMismatch {
            zone,
            index,
            last_known,
        })
    }

    /// Slave side: accept federated entry `index` if it chains onto the last one held here.
    ///
    /// Re-delivery of an entry already held is a success, so pushes are idempotent.
    pub fn apply_log_record(&self, index: LogIndex, prev_index: Option<LogIndex>, command: &str) -> Result<FederatedResponse> {
        let _serial = self.apply_lock.lock();
        let last = self.log.last_federated();

        if matches!(last, Some(known) if index <= known) {
            debug!(index, ?last, "federated entry already held");
            return Ok(FederatedResponse {
                success: true,
                last_known_index: last,
            });
        }

        if prev_index != last {
            debug!(index, ?prev_index, ?last, "federated entry does not chain");
            return Ok(FederatedResponse {
                success: false,
                last_known_index: last,
            });
        }

        self.writer.write_federated(command, index)?;
        Ok(FederatedResponse {
            success: true,
            last_known_index: Some(index),
        })
    }
}

impl RoleListener for FederationManager {
    fn on_leader(&self) {
        self.start();
    }

    fn on_follower(&self) {
        self.stop();
    }

    fn on_applied(&self, _last_applied: LogIndex) {
        self.replicate();
    }
}

impl ZoneHandler for FederationManager {
    fn handle_federated_replicate(&self, request: &FederatedRequest) -> Result<FederatedResponse> {
        if self.mode != FederationMode::Slave {
            return Err(HaError::config(format!("zone {} does not accept federated entries", self.zone_id)));
        }
        self.apply_log_record(request.index, request.prev_index, &request.command)
    }
}

impl Drop for FederationManager {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            pool.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FederationConfig, ZoneEndpoint};
    use crate::machine::MemoryMachine;
    use ha_storage::InMemoryStorage;

    /// Writes straight into a log, as a SOLO slave leader would
    struct DirectWriter(Arc<LogStore>);

    impl LogWriter for DirectWriter {
        fn write_federated(&self, command: &str, federated_index: LogIndex) -> Result<LogIndex> {
            let index = self.0.append(1, command, false, Federation::Replica(federated_index))?;
            self.0.apply_up_to(index)?;
            Ok(index)
        }
    }

    struct RefusingWriter;

    impl LogWriter for RefusingWriter {
        fn write_federated(&self, _command: &str, _federated_index: LogIndex) -> Result<LogIndex> {
            Err(HaError::NotLeader { leader: None })
        }
    }

    fn log() -> Arc<LogStore> {
        Arc::new(LogStore::open(Box::new(InMemoryStorage::new()), Box::new(MemoryMachine::new())).unwrap())
    }

    fn config(mode: FederationMode) -> HaConfig {
        HaConfig {
            replica_retry_floor: Duration::from_millis(10),
            replica_retry_max: Duration::from_millis(50),
            federation: FederationConfig {
                mode,
                zone_id: 1,
                zones: vec![ZoneEndpoint {
                    id: 2,
                    endpoint: "zone-2".into(),
                }],
            },
            ..HaConfig::default()
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Master whose log holds one federated entry that is not applied yet,
    /// wired to a slave registered as zone 2
    fn master_with_unapplied_tail(
        config: &HaConfig,
    ) -> (Arc<FederationManager>, Arc<LogStore>, Arc<FederationManager>, Arc<LogStore>) {
        let master_log = log();
        master_log.append(1, "INSERT fed", false, Federation::Origin).unwrap();

        let (slave, slave_log) = slave();
        let network = crate::local::LocalZoneNetwork::new();
        let handler: Arc<dyn ZoneHandler> = slave.clone();
        network.register(2, Arc::downgrade(&handler));

        let transport: Arc<dyn ZoneTransport> = network;
        let writer = Arc::new(DirectWriter(master_log.clone()));
        let master = FederationManager::new(config, master_log.clone(), writer, Some(transport)).unwrap();
        (master, master_log, slave, slave_log)
    }

    fn slave() -> (Arc<FederationManager>, Arc<LogStore>) {
        let log = log();
        let writer = Arc::new(DirectWriter(log.clone()));
        let manager = FederationManager::new(&config(FederationMode::Slave), log.clone(), writer, None).unwrap();
        (manager, log)
    }

    #[test]
    fn slave_accepts_chained_entries() {
        let (slave, log) = slave();

        let first = slave.apply_log_record(5, None, "INSERT a").unwrap();
        assert!(first.success);
        assert_eq!(first.last_known_index, Some(5));

        assert!(slave.apply_log_record(9, Some(5), "INSERT b").unwrap().success);
        assert_eq!(log.last_federated(), Some(9));
        assert_eq!(log.last_applied(), 2);
    }

    #[test]
    fn slave_rejects_gap_with_its_last_index() {
        let (slave, _) = slave();
        slave.apply_log_record(7, None, "INSERT a").unwrap();

        let response = slave.apply_log_record(10, Some(9), "INSERT c").unwrap();
        assert!(!response.success);
        assert_eq!(response.last_known_index, Some(7));
    }

    #[test]
    fn redelivery_is_idempotent() {
        let (slave, log) = slave();
        slave.apply_log_record(3, None, "INSERT a").unwrap();
        slave.apply_log_record(4, Some(3), "INSERT b").unwrap();

        let again = slave.apply_log_record(3, None, "INSERT a").unwrap();
        assert!(again.success);
        assert_eq!(again.last_known_index, Some(4));
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn slave_without_leadership_reports_error() {
        let log = log();
        let slave = FederationManager::new(&config(FederationMode::Slave), log, Arc::new(RefusingWriter), None).unwrap();
        assert!(matches!(
            slave.apply_log_record(1, None, "INSERT"),
            Err(HaError::NotLeader { .. })
        ));
    }

    #[test]
    fn unapplied_entry_is_retried_until_applied() {
        let (master, master_log, _slave, slave_log) = master_with_unapplied_tail(&config(FederationMode::Master));

        master.cursors.lock().insert(2, ZoneCursor::new(2, 1));
        assert!(matches!(
            master.replicate_zone(2),
            Err(HaError::NotCommitted { index: 1, applied: 0 })
        ));

        master.start();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(slave_log.last_federated(), None);

        // applied behind the manager's back: only the backoff can notice
        master_log.apply_up_to(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || slave_log.last_federated() == Some(1)));
        assert_eq!(master.cursor(2).unwrap().last_acked_index, Some(1));
        master.stop();
    }

    #[test]
    fn applied_notification_wakes_pushers() {
        let mut config = config(FederationMode::Master);
        config.replica_retry_floor = Duration::from_secs(5);
        config.replica_retry_max = Duration::from_secs(30);
        let (master, master_log, _slave, slave_log) = master_with_unapplied_tail(&config);

        master.start();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(slave_log.last_federated(), None);

        master_log.apply_up_to(1).unwrap();
        master.on_applied(1);
        assert!(wait_until(Duration::from_secs(1), || slave_log.last_federated() == Some(1)));
        master.stop();
    }

    #[test]
    fn master_requires_transport() {
        let log = log();
        let writer = Arc::new(DirectWriter(log.clone()));
        assert!(FederationManager::new(&config(FederationMode::Master), log, writer, None).is_err());
    }

    #[test]
    fn rejection_rewinds_cursor_past_last_known() {
        let log = log();
        for i in 1..=10 {
            log.append(1, format!("INSERT {i}"), false, Federation::Origin).unwrap();
        }
        log.apply_up_to(10).unwrap();

        let writer = Arc::new(DirectWriter(log.clone()));
        let transport: Arc<dyn ZoneTransport> = crate::local::LocalZoneNetwork::new();
        let master = FederationManager::new(&config(FederationMode::Master), log, writer, Some(transport)).unwrap();
        master.cursors.lock().insert(2, ZoneCursor::new(2, 9));

        let err = master.replicate_failure(2, 9, Some(7)).unwrap_err();
        assert!(matches!(err, HaError::FederationMismatch { zone: 2, index: 9, last_known: Some(7) }));

        let cursor = master.cursor(2).unwrap();
        assert_eq!(cursor.next_federated_index, 8);
        assert_eq!(cursor.last_acked_index, Some(7));

        master.replicate_success(2, 8);
        assert_eq!(master.cursor(2).unwrap().next_federated_index, 9);
    }
}
