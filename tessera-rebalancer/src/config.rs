//! Rebalancer configuration
//!
//! Service-level settings loaded from environment variables or a TOML file.
//! Per-job options live in `RebalanceConfig`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use tessera_core::RetryPolicy;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Rebalancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    /// Interval between external view polls in milliseconds
    pub external_view_check_interval_ms: u64,

    /// How long to wait for the external view to converge after a step
    pub external_view_stabilization_timeout_ms: u64,

    /// Timeout for each pre-check RPC in milliseconds
    pub pre_check_timeout_ms: u64,

    /// Maximum concurrent pre-check RPCs
    pub pre_check_parallelism: usize,

    /// Disk utilization above which a server is reported unsafe
    pub disk_utilization_threshold: f64,

    /// Retry policy for ideal state compare-and-set
    pub ideal_state_retry: RetryPolicy,

    /// Metrics port for the Prometheus exporter
    pub metrics_port: u16,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            external_view_check_interval_ms: 1_000,
            external_view_stabilization_timeout_ms: 60 * 60 * 1000, // 1 hour
            pre_check_timeout_ms: 30_000,
            pre_check_parallelism: 8,
            disk_utilization_threshold: 0.9,
            ideal_state_retry: RetryPolicy::ideal_state_update(),
            metrics_port: 9090,
        }
    }
}

impl RebalancerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let external_view_check_interval_ms = std::env::var("TESSERA_EV_CHECK_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.external_view_check_interval_ms);

        let external_view_stabilization_timeout_ms = std::env::var("TESSERA_EV_STABILIZATION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.external_view_stabilization_timeout_ms);

        let pre_check_timeout_ms = std::env::var("TESSERA_PRE_CHECK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.pre_check_timeout_ms);

        let pre_check_parallelism = std::env::var("TESSERA_PRE_CHECK_PARALLELISM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.pre_check_parallelism);

        let disk_utilization_threshold = std::env::var("TESSERA_DISK_UTILIZATION_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.disk_utilization_threshold);

        let ideal_state_retry = match std::env::var("TESSERA_IDEAL_STATE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            Some(max_attempts) => RetryPolicy::RandomDelay {
                max_attempts,
                min_delay_ms: 100,
                max_delay_ms: 200,
            },
            None => defaults.ideal_state_retry,
        };

        let metrics_port = std::env::var("TESSERA_METRICS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.metrics_port);

        let config = Self {
            external_view_check_interval_ms,
            external_view_stabilization_timeout_ms,
            pre_check_timeout_ms,
            pre_check_parallelism,
            disk_utilization_threshold,
            ideal_state_retry,
            metrics_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, missing keys take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.disk_utilization_threshold) {
            return Err(ConfigError::InvalidValue(
                "disk_utilization_threshold".to_string(),
                self.disk_utilization_threshold.to_string(),
            ));
        }
        if self.pre_check_parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "pre_check_parallelism".to_string(),
                "0".to_string(),
            ));
        }
        if self.external_view_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "external_view_check_interval_ms".to_string(),
                "0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn external_view_check_interval(&self) -> Duration {
        Duration::from_millis(self.external_view_check_interval_ms)
    }

    pub fn external_view_stabilization_timeout(&self) -> Duration {
        Duration::from_millis(self.external_view_stabilization_timeout_ms)
    }

    pub fn pre_check_timeout(&self) -> Duration {
        Duration::from_millis(self.pre_check_timeout_ms)
    }
}
