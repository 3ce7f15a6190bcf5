//! core::errors
//!
//! Error taxonomy for lock operations.
//!
//! # Design
//!
//! Every failure is returned to the caller as a typed [`LockError`]. Nothing
//! is swallowed except where a no-op is the defined behavior (releasing an
//! already released lock).
//!
//! - [`LockError::InvalidArgument`] and [`LockError::Logic`] are caller bugs
//!   and are never retried.
//! - [`LockError::Unavailable`] is the only transient failure. The library
//!   never retries past the caller's wait budget; the caller may retry with a
//!   fresh one.
//! - [`LockError::ResourceExhausted`] and [`LockError::CapacityExceeded`] fail
//!   the current call only and leave other resources untouched.
//!
//! # Example
//!
//! ```
//! use stacklock::core::errors::{LockError, UnavailableReason};
//! use stacklock::core::level::LockLevel;
//!
//! let err = LockError::Unavailable {
//!     resource: "orders".to_string(),
//!     level: LockLevel::Exclusive,
//!     reason: UnavailableReason::CorruptedRecord,
//! };
//! assert!(err.is_transient());
//! assert!(err.to_string().contains("orders"));
//! ```

use std::time::Duration;

use thiserror::Error;

use super::level::LockLevel;

/// Errors from lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Bad resource name, undefined lock level or malformed usage.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The lock could not be obtained.
    #[error("the {level} lock on resource '{resource}' could not be obtained: {reason}")]
    Unavailable {
        /// Resource that was requested
        resource: String,
        /// Level that was requested
        level: LockLevel,
        /// Why the attempt gave up
        reason: UnavailableReason,
    },

    /// Release without a matching acquire, or use outside an execution unit.
    #[error("lock usage error: {0}")]
    Logic(String),

    /// The shared lock table has no room for another resource.
    #[error("lock table is full ({capacity} resources)")]
    ResourceExhausted {
        /// Configured table capacity
        capacity: usize,
    },

    /// The serialized lock record does not fit in a table row.
    #[error("lock record for '{resource}' needs {size} bytes, limit is {limit}")]
    CapacityExceeded {
        /// Resource whose record overflowed
        resource: String,
        /// Serialized size in bytes
        size: usize,
        /// Configured row limit in bytes
        limit: usize,
    },
}

/// Why an acquire attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UnavailableReason {
    /// The wait budget ran out while the resource was incompatibly held.
    #[error("timed out after {}us", .waited.as_micros())]
    Timeout {
        /// How long the caller actually waited
        waited: Duration,
    },

    /// The stored record was damaged and has been discarded.
    #[error("the stored lock record was corrupted and has been discarded")]
    CorruptedRecord,
}

impl LockError {
    /// Build a timeout failure for `resource`.
    pub fn timeout(resource: &str, level: LockLevel, waited: Duration) -> Self {
        LockError::Unavailable {
            resource: resource.to_string(),
            level,
            reason: UnavailableReason::Timeout { waited },
        }
    }

    /// Build a corrupted-record failure for `resource`.
    pub fn corrupted(resource: &str, level: LockLevel) -> Self {
        LockError::Unavailable {
            resource: resource.to_string(),
            level,
            reason: UnavailableReason::CorruptedRecord,
        }
    }

    /// Check if retrying with a fresh wait budget might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LockError::Unavailable { .. })
    }

    /// Check if this error indicates a bug in the calling code.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, LockError::InvalidArgument(_) | LockError::Logic(_))
    }

    /// Check if this error was a wait-budget timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LockError::Unavailable {
                reason: UnavailableReason::Timeout { .. },
                ..
            }
        )
    }
}

/// Validate a resource name.
///
/// # Errors
///
/// Returns [`LockError::InvalidArgument`] for an empty or all-whitespace name.
pub fn validate_resource(resource: &str) -> Result<(), LockError> {
    if resource.trim().is_empty() {
        return Err(LockError::InvalidArgument(
            "there is no resource provided".to_string(),
        ));
    }
    Ok(())
}
