//! core::config::schema
//!
//! Configuration schema types.
//!
//! # Validation
//!
//! Values are validated after parsing so that a bad file fails at load time
//! rather than at the first acquire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Default shared table size in rows, i.e. the maximum number of locked
/// resources.
pub const DEFAULT_TABLE_CAPACITY: usize = 10_000;

/// Default maximum serialized record size per resource, in bytes.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024;

/// Default pause between acquire attempts, in microseconds.
pub const DEFAULT_WAIT_STEP_US: u64 = 1000;

/// Smallest accepted pause between acquire attempts, in microseconds.
///
/// Timer resolution of the async runtime is one millisecond.
pub const MIN_WAIT_STEP_US: u64 = 1000;

/// Default lease length, in microseconds (120 s).
pub const DEFAULT_HOLD_US: u64 = 120 * 1_000_000;

/// Default wait budget, in microseconds (120 s).
pub const DEFAULT_WAIT_US: u64 = 120 * 1_000_000;

/// Smallest accepted record limit. A single holder needs roughly 60 bytes.
pub const MIN_RECORD_BYTES: usize = 64;

/// Backend names accepted by the `backend` key.
pub const VALID_BACKENDS: &[&str] = &["table", "null"];

/// Lock system configuration.
///
/// # Example
///
/// ```toml
/// backend = "table"
/// table_capacity = 10000
/// max_record_bytes = 1024
/// wait_step_us = 1000
/// default_hold_us = 120000000
/// default_wait_us = 120000000
/// corruption_log_level = "error"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// Backend kind ("table" or "null")
    pub backend: String,

    /// Maximum number of resources the shared table can hold
    pub table_capacity: usize,

    /// Maximum serialized record size per resource
    pub max_record_bytes: usize,

    /// Pause between acquire attempts, in microseconds
    pub wait_step_us: u64,

    /// Default lease length, in microseconds
    pub default_hold_us: u64,

    /// Default wait budget, in microseconds
    pub default_wait_us: u64,

    /// Severity used to report damaged lock records
    pub corruption_log_level: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: "table".to_string(),
            table_capacity: DEFAULT_TABLE_CAPACITY,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            wait_step_us: DEFAULT_WAIT_STEP_US,
            default_hold_us: DEFAULT_HOLD_US,
            default_wait_us: DEFAULT_WAIT_US,
            corruption_log_level: "error".to_string(),
        }
    }
}

impl LockConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_BACKENDS.contains(&self.backend.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "invalid backend '{}', must be one of: {}",
                self.backend,
                VALID_BACKENDS.join(", ")
            )));
        }

        if self.table_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "table_capacity must be at least 1".to_string(),
            ));
        }

        if self.max_record_bytes < MIN_RECORD_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "max_record_bytes must be at least {}, got {}",
                MIN_RECORD_BYTES, self.max_record_bytes
            )));
        }

        if self.wait_step_us < MIN_WAIT_STEP_US {
            return Err(ConfigError::InvalidValue(format!(
                "wait_step_us must be {} or more microseconds, got {}",
                MIN_WAIT_STEP_US, self.wait_step_us
            )));
        }

        self.corruption_log_level()?;

        Ok(())
    }

    /// Pause between acquire attempts.
    pub fn wait_step(&self) -> Duration {
        Duration::from_micros(self.wait_step_us)
    }

    /// Default lease length.
    pub fn default_hold(&self) -> Duration {
        Duration::from_micros(self.default_hold_us)
    }

    /// Default wait budget.
    pub fn default_wait(&self) -> Duration {
        Duration::from_micros(self.default_wait_us)
    }

    /// Parsed severity for damaged-record reports.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unknown level name.
    pub fn corruption_log_level(&self) -> Result<tracing::Level, ConfigError> {
        self.corruption_log_level
            .parse::<tracing::Level>()
            .map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "invalid corruption_log_level '{}', must be one of: trace, debug, info, warn, error",
                    self.corruption_log_level
                ))
            })
    }
}
