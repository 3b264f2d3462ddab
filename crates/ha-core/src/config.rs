//! # config
//!
//! why: timers, retention and membership the core is tuned by
//! relations: read by raft/, replica.rs, federation.rs and server.rs
//! what: HaConfig, FederationConfig, toml loading, HA_* environment overrides, validation

use crate::error::{HaError, Result};
use crate::{ServerId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Parse an environment variable as a typed value with a default fallback
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis_or(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_var_or_default(key, default.as_millis() as u64))
}

/// A cluster member and the endpoint its RPCs are served on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub id: ServerId,
    pub endpoint: String,
}

/// A child zone reachable through federation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneEndpoint {
    pub id: ZoneId,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FederationMode {
    /// No federation: the zone stands alone
    #[default]
    Standalone,
    /// Pushes federated entries to child zones
    Master,
    /// Receives federated entries from the master zone
    Slave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub mode: FederationMode,
    pub zone_id: ZoneId,
    /// Child zones, master mode only
    pub zones: Vec<ZoneEndpoint>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            mode: FederationMode::Standalone,
            zone_id: 0,
            zones: Vec::new(),
        }
    }
}

/// Configuration for one server of the HA core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// This server's id
    pub server_id: ServerId,
    /// Every cluster member, this server included. Empty or self-only means SOLO.
    pub servers: Vec<ServerEndpoint>,

    /// Base election timeout; each round adds a random share of it
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Timeout of every synchronous RPC (vote, replicate, federation push)
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// How long a writer waits for quorum
    #[serde(with = "humantime_serde")]
    pub quorum_timeout: Duration,
    /// Tick of the timer thread evaluating election and heartbeat deadlines
    #[serde(with = "humantime_serde")]
    pub timer_period: Duration,
    #[serde(with = "humantime_serde")]
    pub purge_period: Duration,

    /// Applied entries kept in the ordinary index space
    pub log_retention: u64,
    /// Applied entries kept in the federated index space
    pub federated_log_retention: u64,
    /// Upper bound of entries deleted per purge call
    pub purge_batch_size: usize,

    /// Floor of the replica workers' retry timer
    #[serde(with = "humantime_serde")]
    pub replica_retry_floor: Duration,
    /// Cap of the replica workers' retry timer
    #[serde(with = "humantime_serde")]
    pub replica_retry_max: Duration,

    pub federation: FederationConfig,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            servers: Vec::new(),
            election_timeout: Duration::from_millis(2500),
            heartbeat_interval: Duration::from_millis(500),
            rpc_timeout: Duration::from_millis(450),
            quorum_timeout: Duration::from_secs(10),
            timer_period: Duration::from_millis(50),
            purge_period: Duration::from_secs(600),
            log_retention: 250_000,
            federated_log_retention: 1_000_000,
            purge_batch_size: 100_000,
            replica_retry_floor: Duration::from_millis(100),
            replica_retry_max: Duration::from_secs(30),
            federation: FederationConfig::default(),
        }
    }
}

impl HaConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HaError::config(format!("invalid toml: {e}")))
    }

    /// Load a TOML file, apply `HA_*` overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HaError::config(format!("cannot read {}: {e}", path.display())))?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override numeric settings from the environment
    pub fn apply_env_overrides(&mut self) {
        self.server_id = env_var_or_default("HA_SERVER_ID", self.server_id);
        self.election_timeout = env_millis_or("HA_ELECTION_TIMEOUT_MS", self.election_timeout);
        self.heartbeat_interval = env_millis_or("HA_HEARTBEAT_INTERVAL_MS", self.heartbeat_interval);
        self.rpc_timeout = env_millis_or("HA_RPC_TIMEOUT_MS", self.rpc_timeout);
        self.quorum_timeout = env_millis_or("HA_QUORUM_TIMEOUT_MS", self.quorum_timeout);
        self.log_retention = env_var_or_default("HA_LOG_RETENTION", self.log_retention);
        self.federated_log_retention =
            env_var_or_default("HA_FEDERATED_LOG_RETENTION", self.federated_log_retention);
        self.purge_batch_size = env_var_or_default("HA_PURGE_BATCH_SIZE", self.purge_batch_size);
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout <= self.heartbeat_interval * 2 {
            return Err(HaError::config(format!(
                "election timeout {:?} must exceed twice the heartbeat interval {:?}",
                self.election_timeout, self.heartbeat_interval
            )));
        }

        if self.rpc_timeout.is_zero() {
            return Err(HaError::config("rpc timeout must be greater than 0"));
        }

        if self.timer_period.is_zero() {
            return Err(HaError::config("timer period must be greater than 0"));
        }

        if self.replica_retry_floor.is_zero() || self.replica_retry_floor > self.replica_retry_max {
            return Err(HaError::config(format!(
                "replica retry floor {:?} must be non-zero and not exceed the max {:?}",
                self.replica_retry_floor, self.replica_retry_max
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id) {
                return Err(HaError::config(format!("duplicate server id {}", server.id)));
            }
        }

        if !self.servers.is_empty() && !seen.contains(&self.server_id) {
            return Err(HaError::config(format!(
                "server {} is not part of the configured servers",
                self.server_id
            )));
        }

        if self.federation.mode == FederationMode::Master && self.federation.zones.is_empty() {
            return Err(HaError::config("federation master needs at least one zone"));
        }

        Ok(())
    }

    /// Every other cluster member
    pub fn peers(&self) -> Vec<ServerId> {
        self.servers
            .iter()
            .map(|s| s.id)
            .filter(|id| *id != self.server_id)
            .collect()
    }

    pub fn is_solo(&self) -> bool {
        self.peers().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_servers() -> HaConfig {
        HaConfig {
            server_id: 1,
            servers: (1..=3)
                .map(|id| ServerEndpoint {
                    id,
                    endpoint: format!("10.0.0.{id}:2633"),
                })
                .collect(),
            ..HaConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid_and_solo() {
        let config = HaConfig::default();
        config.validate().unwrap();
        assert!(config.is_solo());
    }

    #[test]
    fn parses_toml_with_human_durations() {
        let config = HaConfig::from_toml_str(
            r#"
            server_id = 2
            election_timeout = "3s"
            heartbeat_interval = "300ms"
            log_retention = 10

            [[servers]]
            id = 1
            endpoint = "a:2633"

            [[servers]]
            id = 2
            endpoint = "b:2633"

            [federation]
            mode = "master"
            zone_id = 0

            [[federation.zones]]
            id = 100
            endpoint = "zone-b:2633"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_id, 2);
        assert_eq!(config.election_timeout, Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(300));
        assert_eq!(config.log_retention, 10);
        assert_eq!(config.peers(), vec![1]);
        assert_eq!(config.federation.mode, FederationMode::Master);
        assert_eq!(config.federation.zones[0].id, 100);
        // unspecified fields keep their defaults
        assert_eq!(config.purge_batch_size, 100_000);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_election_timeout_too_close_to_heartbeat() {
        let config = HaConfig {
            election_timeout: Duration::from_millis(900),
            heartbeat_interval: Duration::from_millis(500),
            ..three_servers()
        };
        assert!(matches!(config.validate(), Err(HaError::Configuration { .. })));
    }

    #[test]
    fn rejects_server_missing_from_membership() {
        let config = HaConfig {
            server_id: 9,
            ..three_servers()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_servers() {
        let mut config = three_servers();
        config.servers.push(config.servers[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_master_without_zones() {
        let mut config = three_servers();
        config.federation.mode = FederationMode::Master;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let config = HaConfig {
            replica_retry_floor: Duration::from_secs(5),
            replica_retry_max: Duration::from_secs(1),
            ..three_servers()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn peers_exclude_self() {
        assert_eq!(three_servers().peers(), vec![2, 3]);
    }
}
