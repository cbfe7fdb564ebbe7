//! Driver configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Dataplane driver configuration. Intervals of zero disable the matching
/// periodic refresh.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// How many extra messages to drain from a queue after the first.
    pub msg_peek_limit: usize,
    pub throttle_bucket_size: u32,
    pub throttle_refill_interval_ms: u64,
    pub throttle_refill_jitter_ms: u64,
    pub ip_sets_refresh_interval_ms: u64,
    pub route_refresh_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub health_interval_ms: u64,
    pub degraded_after_failures: u32,
    /// Interface name prefixes eligible to back a packet capture.
    pub capture_iface_prefixes: Vec<String>,
    /// Whether kube-proxy runs in IPVS mode on this node.
    pub kube_ipvs_support_enabled: bool,
    /// Test hook: wedge the driver loop after this long.
    pub debug_simulate_hang_after_ms: Option<u64>,
    pub capture_dir: PathBuf,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            msg_peek_limit: 100,
            throttle_bucket_size: 10,
            throttle_refill_interval_ms: 100,
            throttle_refill_jitter_ms: 10,
            ip_sets_refresh_interval_ms: 90_000,
            route_refresh_interval_ms: 90_000,
            retry_interval_ms: 10_000,
            health_interval_ms: 10_000,
            degraded_after_failures: 5,
            capture_iface_prefixes: vec!["cali".to_string()],
            kube_ipvs_support_enabled: false,
            debug_simulate_hang_after_ms: None,
            capture_dir: PathBuf::from("/var/lib/mvirt/dataplane/captures"),
        }
    }
}

impl DataplaneConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.msg_peek_limit == 0 {
            return Err(ConfigError::Invalid("msg_peek_limit must be > 0".to_string()));
        }
        if self.throttle_bucket_size == 0 {
            return Err(ConfigError::Invalid(
                "throttle_bucket_size must be > 0".to_string(),
            ));
        }
        if self.throttle_refill_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "throttle_refill_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn throttle_refill_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_refill_interval_ms)
    }

    pub fn throttle_refill_jitter(&self) -> Duration {
        Duration::from_millis(self.throttle_refill_jitter_ms)
    }

    pub fn ip_sets_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.ip_sets_refresh_interval_ms)
    }

    pub fn route_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.route_refresh_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn debug_simulate_hang_after(&self) -> Option<Duration> {
        self.debug_simulate_hang_after_ms.map(Duration::from_millis)
    }
}
