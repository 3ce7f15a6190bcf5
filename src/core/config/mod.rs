//! core::config
//!
//! Configuration schema and loading.
//!
//! # Locations
//!
//! [`load_default`] searches, in order:
//! 1. `$STACKLOCK_CONFIG` if set
//! 2. `<config_dir>/stacklock/config.toml` (e.g. `$XDG_CONFIG_HOME` on Linux)
//!
//! A missing file is not an error: defaults are used.
//!
//! # Example
//!
//! ```no_run
//! use stacklock::core::config::LockConfig;
//! use std::path::Path;
//!
//! let config = LockConfig::load(Path::new("/etc/stacklock.toml")).unwrap();
//! println!("capacity: {}", config.table_capacity);
//! ```
//!
//! [`load_default`]: LockConfig::load_default

pub mod schema;

pub use schema::LockConfig;

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "STACKLOCK_CONFIG";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

impl LockConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: LockConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validated.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LockConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError {
                path: PathBuf::from("<string>"),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the standard locations.
    ///
    /// Returns the config and the path it was loaded from, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but is invalid.
    pub fn load_default() -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                let config = Self::load(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// The first config path that would be consulted by [`load_default`].
    ///
    /// [`load_default`]: LockConfig::load_default
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("stacklock").join("config.toml"))
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue(e.to_string()))
    }
}
