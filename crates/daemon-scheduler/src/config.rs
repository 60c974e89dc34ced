// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the daemon scheduler.

use std::path::PathBuf;
use std::time::Duration;

/// Daemon scheduler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing the environment store
    pub database_path: PathBuf,
    /// How often the scheduler reconciles every environment
    pub scheduler_interval: Duration,
    /// How often the monitor asks for in-progress deployments to be advanced
    pub monitor_interval: Duration,
    /// How long a dispatched start is trusted before asking the orchestrator
    pub tracking_ttl: Duration,
    /// Bound of the dispatcher's input and output channels
    pub event_channel_capacity: usize,
    /// Attempts made by a store transaction before giving up on conflicts
    pub store_max_retries: u32,
    /// Optional simulated cluster for local runs
    pub simulation: Option<SimulationConfig>,
}

/// Settings for running against the in-memory simulated cluster.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Cluster name to simulate
    pub cluster: String,
    /// Number of instances registered in the cluster at startup
    pub instances: usize,
    /// Environment created at startup, if any
    pub environment: Option<String>,
    /// Task definition of the bootstrapped environment
    pub task_definition: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = PathBuf::from(
            std::env::var("BLOX_DATABASE_PATH")
                .unwrap_or_else(|_| ".data/daemon-scheduler.db".to_string()),
        );

        let scheduler_interval =
            Duration::from_secs(parse_var("BLOX_SCHEDULER_INTERVAL_SECS", 10)?);
        let monitor_interval = Duration::from_secs(parse_var("BLOX_MONITOR_INTERVAL_SECS", 10)?);
        let tracking_ttl = Duration::from_secs(parse_var("BLOX_TRACKING_TTL_SECS", 60)?);
        let event_channel_capacity = parse_var("BLOX_EVENT_CHANNEL_CAPACITY", 100)?;
        let store_max_retries = parse_var("BLOX_STORE_MAX_RETRIES", 16)?;

        if scheduler_interval.is_zero() || monitor_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "BLOX_SCHEDULER_INTERVAL_SECS / BLOX_MONITOR_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        if event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BLOX_EVENT_CHANNEL_CAPACITY",
                value: "0".to_string(),
            });
        }

        let simulation = match std::env::var("BLOX_SIM_CLUSTER") {
            Ok(cluster) if !cluster.is_empty() => Some(SimulationConfig {
                cluster,
                instances: parse_var("BLOX_SIM_INSTANCES", 0)?,
                environment: std::env::var("BLOX_SIM_ENVIRONMENT")
                    .ok()
                    .filter(|v| !v.is_empty()),
                task_definition: std::env::var("BLOX_SIM_TASK_DEFINITION")
                    .unwrap_or_else(|_| "daemon:1".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            database_path,
            scheduler_interval,
            monitor_interval,
            tracking_ttl,
            event_channel_capacity,
            store_max_retries,
            simulation,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed or is out of range.
    #[error("Invalid value '{value}' for {name}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u64 = parse_var("BLOX_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            name: "BLOX_TRACKING_TTL_SECS",
            value: "soon".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value 'soon' for BLOX_TRACKING_TTL_SECS"
        );
    }
}
