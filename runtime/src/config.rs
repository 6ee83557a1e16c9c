//! Environment-driven configuration.
//!
//! Every setting has a default except `DATABASE_URL`. Values are read once at
//! startup and validated before anything is spawned.
//!
//! | variable                   | default          |
//! |----------------------------|------------------|
//! | `RELAY_INTERVAL_MS`        | 5000             |
//! | `RELAY_BATCH_SIZE`         | 100              |
//! | `RELAY_FULL_RESCAN_EVERY`  | 60 (0 disables)  |
//! | `WORKER_BATCH_CAPACITY`    | 100              |
//! | `WORKER_BUFFER_CAPACITY`   | 1000             |
//! | `WORKER_FLUSH_INTERVAL_MS` | 1000             |
//! | `WORKER_BACKOFF_MS`        | 1000             |
//! | `DATABASE_URL`             | required         |
//! | `KAFKA_BROKERS`            | `localhost:9092` |
//! | `SERVICE_NAME`             | per binary       |
//! | `METRICS_ADDR`             | `0.0.0.0:9090`   |
//! | `SHUTDOWN_TIMEOUT_MS`      | 30000            |
//!
//! # Example
//!
//! ```no_run
//! use outbox_relay_runtime::config::{RelayConfig, WorkerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayConfig::from_env()?;
//! let worker = WorkerConfig::from_env()?;
//! println!("relaying {} rows every {:?}", relay.batch_size, relay.interval);
//! # Ok(())
//! # }
//! ```

use crate::backoff::BackoffPolicy;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// Environment variable set to an unparseable value
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    ParseError {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Read `var` through `lookup` and parse it, falling back to `default`.
fn parse_or<T, F>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            var: var.to_string(),
            value,
            reason: e.to_string(),
        }),
    }
}

fn millis_or<F>(lookup: &F, var: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, var, default_ms).map(Duration::from_millis)
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Relay job configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Time between ticks
    pub interval: Duration,
    /// Maximum rows claimed per tick
    pub batch_size: usize,
    /// Every this many ticks, scan without the cursor; `0` disables
    pub full_rescan_every: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            full_rescan_every: 60,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is unparseable or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    /// Load through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is unparseable or the result is invalid
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            interval: millis_or(&lookup, "RELAY_INTERVAL_MS", defaults.interval)?,
            batch_size: parse_or(&lookup, "RELAY_BATCH_SIZE", defaults.batch_size)?,
            full_rescan_every: parse_or(
                &lookup,
                "RELAY_FULL_RESCAN_EVERY",
                defaults.full_rescan_every,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate relay configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ValidationError("relay interval must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError("relay batch_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Topic worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Messages per batch (C)
    pub batch_capacity: usize,
    /// Capacity of the fetch → flush hand-off buffer
    pub buffer_capacity: usize,
    /// Longest time a partial batch waits before being flushed
    pub flush_interval: Duration,
    /// Delay between retries of fetch, apply and commit
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_capacity: 100,
            buffer_capacity: 1000,
            flush_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is unparseable or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    /// Load through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is unparseable or the result is invalid
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            batch_capacity: parse_or(&lookup, "WORKER_BATCH_CAPACITY", defaults.batch_capacity)?,
            buffer_capacity: parse_or(&lookup, "WORKER_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            flush_interval: millis_or(&lookup, "WORKER_FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            backoff: BackoffPolicy::fixed(millis_or(
                &lookup,
                "WORKER_BACKOFF_MS",
                defaults.backoff.initial_delay,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate worker configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_capacity == 0 {
            return Err(ConfigError::ValidationError("batch_capacity must be > 0".to_string()));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError("buffer_capacity must be > 0".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ValidationError("flush_interval must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Process-level settings shared by the binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Postgres connection string
    pub database_url: String,
    /// Comma-separated bootstrap brokers
    pub kafka_brokers: String,
    /// Service name, used as consumer-group prefix
    pub service_name: String,
    /// Prometheus listener
    pub metrics_addr: SocketAddr,
    /// Upper bound on graceful shutdown
    pub shutdown_timeout: Duration,
}

impl ServiceConfig {
    /// Load from the process environment, using `default_service_name` when
    /// `SERVICE_NAME` is unset.
    ///
    /// # Errors
    ///
    /// Returns error if `DATABASE_URL` is missing, a variable is unparseable,
    /// or the result is invalid
    pub fn from_env(default_service_name: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(default_service_name, process_env)
    }

    /// Load through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if `DATABASE_URL` is missing, a variable is unparseable,
    /// or the result is invalid
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(
        default_service_name: &str,
        lookup: F,
    ) -> Result<Self, ConfigError> {
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::EnvVarNotSet("DATABASE_URL".to_string()))?;
        let config = Self {
            database_url,
            kafka_brokers: lookup("KAFKA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string()),
            metrics_addr: parse_or(
                &lookup,
                "METRICS_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 9090)),
            )?,
            shutdown_timeout: millis_or(&lookup, "SHUTDOWN_TIMEOUT_MS", Duration::from_secs(30))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate service configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationError("DATABASE_URL cannot be empty".to_string()));
        }
        if self.kafka_brokers.is_empty() {
            return Err(ConfigError::ValidationError("KAFKA_BROKERS cannot be empty".to_string()));
        }
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError("SERVICE_NAME cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Consumer group for `topic`: one per (service, topic) pair.
    #[must_use]
    pub fn consumer_group(&self, topic: &str) -> String {
        format!("{}-{topic}", self.service_name)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(RelayConfig::from_lookup(env(&[])).unwrap(), RelayConfig::default());
        assert_eq!(WorkerConfig::from_lookup(env(&[])).unwrap(), WorkerConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let worker = WorkerConfig::from_lookup(env(&[
            ("WORKER_BATCH_CAPACITY", "10"),
            ("WORKER_FLUSH_INTERVAL_MS", "250"),
            ("WORKER_BACKOFF_MS", "50"),
        ]))
        .unwrap();
        assert_eq!(worker.batch_capacity, 10);
        assert_eq!(worker.flush_interval, Duration::from_millis(250));
        assert_eq!(worker.backoff, BackoffPolicy::fixed(Duration::from_millis(50)));
    }

    #[test]
    fn unparseable_value_names_the_variable() {
        let err = RelayConfig::from_lookup(env(&[("RELAY_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref var, .. } if var == "RELAY_BATCH_SIZE"));
    }

    #[test]
    fn zero_batch_capacity_is_rejected() {
        let err = WorkerConfig::from_lookup(env(&[("WORKER_BATCH_CAPACITY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn service_config_requires_database_url() {
        assert_eq!(
            ServiceConfig::from_lookup("stats", env(&[])).unwrap_err(),
            ConfigError::EnvVarNotSet("DATABASE_URL".to_string())
        );

        let config =
            ServiceConfig::from_lookup("stats", env(&[("DATABASE_URL", "postgres://localhost/stats")]))
                .unwrap();
        assert_eq!(config.kafka_brokers, "localhost:9092");
        assert_eq!(config.consumer_group("view"), "stats-view");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }
}
