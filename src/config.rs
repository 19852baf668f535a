//! Performance manager configuration.
//!
//! The configuration lives in the `[pm]` table of a TOML file. Every field is
//! optional; missing fields take the defaults below.
//!
//! ```toml
//! [pm]
//! max_parallel_nodes = 10
//! pma_batch_size = 2
//! max_retries = 3
//! rcv_wait_interval_ms = 100
//! min_rcv_wait_interval_ms = 0
//! ```

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::PoolConfig;

/// Name of the configuration table.
pub const CONFIG_TABLE: &str = "pm";

/// Hash buckets of a lid-routed pool.
pub const LID_HASH_DEPTH: usize = 79;

/// Configuration loading error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file")]
    Io(#[from] io::Error),

    #[error("malformed configuration")]
    Toml(#[from] toml::de::Error),

    #[error("configuration table `{0}` not found")]
    MissingTable(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Read-only PM configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmConfig {
    /// Devices queried in parallel.
    pub max_parallel_nodes: usize,
    /// Packets in flight per device.
    pub pma_batch_size: usize,
    /// Transmissions per request in non-stepped mode.
    pub max_retries: u32,
    /// Per-attempt response timeout in non-stepped mode.
    pub rcv_wait_interval_ms: u64,
    /// A non-zero value enables stepped retries starting at this timeout.
    pub min_rcv_wait_interval_ms: u64,
    pub timeout_adder_ms: u64,
    /// Fail a request as soon as a resend fails.
    pub error_on_send_fail: bool,
    pub process_vl_counters: bool,
    /// Re-query the ports of a failed multi-port packet one at a time.
    pub isolate_failed_ports: bool,
    pub no_merge: bool,
    pub lli_resolution: u8,
    pub ler_resolution: u8,
    /// Source lid stamped into requests.
    pub pm_slid: u32,
    pub rng_seed: Option<u64>,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            pma_batch_size: 2,
            max_retries: 3,
            rcv_wait_interval_ms: 100,
            min_rcv_wait_interval_ms: 0,
            timeout_adder_ms: 0,
            error_on_send_fail: true,
            process_vl_counters: true,
            isolate_failed_ports: true,
            no_merge: false,
            lli_resolution: 0,
            ler_resolution: 0,
            pm_slid: 0,
            rng_seed: None,
        }
    }
}

impl PmConfig {
    /// Load the `[pm]` table of a TOML file.
    pub fn load_toml(config_file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(config_file)?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse the `[pm]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut toml: toml::Table = toml::from_str(toml_str)?;
        let table = match toml.remove(CONFIG_TABLE) {
            Some(t @ toml::Value::Table(_)) => t,
            _ => return Err(ConfigError::MissingTable(CONFIG_TABLE)),
        };
        let config: Self = table.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_nodes == 0 {
            return Err(ConfigError::Invalid("max_parallel_nodes must be non-zero"));
        }
        if self.pma_batch_size == 0 {
            return Err(ConfigError::Invalid("pma_batch_size must be non-zero"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be non-zero"));
        }
        if self.pma_batch_size > u16::MAX as usize || self.max_parallel_nodes > u16::MAX as usize {
            return Err(ConfigError::Invalid("too many nodes or packets in flight"));
        }
        Ok(())
    }

    /// Whether stepped retries are enabled.
    #[inline]
    pub fn stepped(&self) -> bool {
        self.min_rcv_wait_interval_ms != 0
    }

    #[inline]
    pub fn rcv_wait_interval(&self) -> Duration {
        Duration::from_millis(self.rcv_wait_interval_ms)
    }

    #[inline]
    pub fn min_rcv_wait_interval(&self) -> Duration {
        Duration::from_millis(self.min_rcv_wait_interval_ms)
    }

    /// Context pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        let default_timeout = if self.stepped() {
            self.min_rcv_wait_interval()
        } else {
            self.rcv_wait_interval()
        };
        PoolConfig {
            size: self.max_parallel_nodes * self.pma_batch_size,
            hash_depth: LID_HASH_DEPTH,
            max_retries: self.max_retries,
            default_timeout,
            min_timeout: self.min_rcv_wait_interval(),
            total_timeout: self.rcv_wait_interval() * self.max_retries,
            timeout_adder: Duration::from_millis(self.timeout_adder_ms),
            error_on_send_fail: self.error_on_send_fail,
            response_queue: None,
            rng_seed: self.rng_seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_table() {
        let config = PmConfig::from_toml_str("[pm]\n").unwrap();
        assert_eq!(config, PmConfig::default());
    }

    #[test]
    fn test_partial_table() {
        let config = PmConfig::from_toml_str(
            r#"
            [other]
            x = 1

            [pm]
            max_parallel_nodes = 4
            min_rcv_wait_interval_ms = 20
            rng_seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_nodes, 4);
        assert_eq!(config.pma_batch_size, 2);
        assert!(config.stepped());
        assert_eq!(config.rng_seed, Some(7));

        let pool = config.pool_config();
        assert_eq!(pool.size, 8);
        assert_eq!(pool.hash_depth, LID_HASH_DEPTH);
        assert_eq!(pool.default_timeout, Duration::from_millis(20));
        assert_eq!(pool.total_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            PmConfig::from_toml_str("[other]\n"),
            Err(ConfigError::MissingTable("pm"))
        ));
        assert!(matches!(
            PmConfig::from_toml_str("[pm]\npma_batch_size = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PmConfig::from_toml_str("[pm]\nmax_retries = \"three\"\n"),
            Err(ConfigError::Toml(_))
        ));
    }
}
