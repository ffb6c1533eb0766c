//! NetworkDB configuration.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use super::NetworkDbError;

/// Tunables for one NetworkDB instance. All durations are plain integers so
/// the struct deserializes directly from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkDbConfig {
    /// Unique node identifier; a random one is generated when unset.
    pub node_id: String,
    pub hostname: String,
    /// Address the UDP gossip socket and TCP bulk-sync listener bind to.
    pub bind_addr: IpAddr,
    /// Port for both transports; 0 lets the OS pick.
    pub bind_port: u16,
    /// Address advertised to peers when it differs from `bind_addr`.
    pub advertise_addr: Option<IpAddr>,
    /// Gossip encryption keys (base64). Carried for config compatibility;
    /// the transport itself does not encrypt.
    pub keyring: Vec<String>,
    /// How long tombstones linger before being reaped.
    pub reap_entry_interval_secs: u64,
    /// How long failed and departed nodes are remembered.
    pub node_reap_interval_secs: u64,
    /// Silence threshold after which an active node is marked failed.
    pub node_failure_timeout_ms: u64,
    pub gossip_interval_ms: u64,
    pub bulk_sync_interval_secs: u64,
    pub rejoin_cluster_interval_secs: u64,
    pub rejoin_cluster_duration_secs: u64,
    pub stats_print_period_secs: u64,
}

impl Default for NetworkDbConfig {
    fn default() -> Self {
        Self {
            node_id: random_node_id(),
            hostname: default_hostname(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 0,
            advertise_addr: None,
            keyring: Vec::new(),
            reap_entry_interval_secs: 30 * 60,
            node_reap_interval_secs: 24 * 60 * 60,
            node_failure_timeout_ms: 10_000,
            gossip_interval_ms: 200,
            bulk_sync_interval_secs: 30,
            rejoin_cluster_interval_secs: 60,
            rejoin_cluster_duration_secs: 10,
            stats_print_period_secs: 300,
        }
    }
}

impl NetworkDbConfig {
    pub fn reap_entry_interval(&self) -> Duration {
        Duration::from_secs(self.reap_entry_interval_secs)
    }

    pub fn node_reap_interval(&self) -> Duration {
        Duration::from_secs(self.node_reap_interval_secs)
    }

    pub fn node_failure_timeout(&self) -> Duration {
        Duration::from_millis(self.node_failure_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn bulk_sync_interval(&self) -> Duration {
        Duration::from_secs(self.bulk_sync_interval_secs)
    }

    pub fn rejoin_cluster_interval(&self) -> Duration {
        Duration::from_secs(self.rejoin_cluster_interval_secs)
    }

    pub fn rejoin_cluster_duration(&self) -> Duration {
        Duration::from_secs(self.rejoin_cluster_duration_secs)
    }

    pub fn stats_print_period(&self) -> Duration {
        Duration::from_secs(self.stats_print_period_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), NetworkDbError> {
        if self.node_id.is_empty() {
            return Err(NetworkDbError::Config("node_id must not be empty".to_string()));
        }
        for field in [
            ("reap_entry_interval_secs", self.reap_entry_interval_secs),
            ("node_reap_interval_secs", self.node_reap_interval_secs),
            ("node_failure_timeout_ms", self.node_failure_timeout_ms),
            ("gossip_interval_ms", self.gossip_interval_ms),
            ("bulk_sync_interval_secs", self.bulk_sync_interval_secs),
            ("rejoin_cluster_interval_secs", self.rejoin_cluster_interval_secs),
        ] {
            if field.1 == 0 {
                return Err(NetworkDbError::Config(format!("{} must be non-zero", field.0)));
            }
        }
        Ok(())
    }
}

/// Load a config from a TOML file and validate it.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<NetworkDbConfig, NetworkDbError> {
    let text = fs::read_to_string(path)
        .map_err(|e| NetworkDbError::Config(format!("failed to read config file: {e}")))?;
    let config: NetworkDbConfig = toml::from_str(&text)
        .map_err(|e| NetworkDbError::Config(format!("failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

fn random_node_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
