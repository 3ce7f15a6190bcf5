//! backend
//!
//! Shared lock stores.
//!
//! # Architecture
//!
//! Every lock store implements the [`Backend`] trait. Execution units that
//! should see each other's locks share one backend (or one [`SharedTable`]):
//!
//! - [`SharedTableBackend`]: records in a fixed-capacity concurrent table (default)
//! - [`NullBackend`]: grants everything, stores nothing
//!
//! # Provider Selection
//!
//! Use [`create_backend`] to build the backend named by configuration:
//!
//! ```
//! use stacklock::backend::create_backend;
//! use stacklock::core::config::LockConfig;
//!
//! let backend = create_backend(&LockConfig::default()).unwrap();
//! assert_eq!(backend.name(), "table");
//! ```

mod null;
mod record;
mod shared_table;
mod table;
mod traits;

use std::sync::Arc;

pub use null::NullBackend;
pub use record::{Holder, LockRecord, RecordError, SweepOutcome};
pub use shared_table::{SharedTableBackend, StatsSnapshot};
pub use table::{SharedTable, TableError};
pub use traits::{Attempt, Backend, DEFAULT_WAIT_STEP};

use crate::core::config::{ConfigError, LockConfig};

/// The default backend name.
pub const DEFAULT_BACKEND: &str = "table";

/// Create the backend named by `config.backend`.
///
/// # Backends
///
/// - `"table"` (default): a [`SharedTableBackend`] over a fresh table sized
///   by `table_capacity` and `max_record_bytes`
/// - `"null"`: a [`NullBackend`]
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] for an unknown backend name or an
/// invalid configuration.
pub fn create_backend(config: &LockConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    config.validate()?;
    match config.backend.as_str() {
        "table" => Ok(Arc::new(SharedTableBackend::from_config(config)?)),
        "null" => Ok(Arc::new(NullBackend::new())),
        other => Err(ConfigError::InvalidValue(format!(
            "unknown backend: '{}' (valid: table, null)",
            other
        ))),
    }
}
