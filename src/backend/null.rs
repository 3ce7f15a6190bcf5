//! backend::null
//!
//! A backend that grants everything and stores nothing.
//!
//! Useful where the lock manager API is required but no cross-unit exclusion
//! is wanted (single-unit tools, tests of calling code).

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{Attempt, Backend};
use crate::core::errors::{validate_resource, LockError};
use crate::core::level::LockLevel;
use crate::core::owner::OwnerId;

/// Backend that never blocks and keeps no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl NullBackend {
    /// Create a null backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn try_acquire(
        &self,
        _owner: OwnerId,
        resource: &str,
        _level: LockLevel,
        _hold: Duration,
    ) -> Result<Attempt, LockError> {
        validate_resource(resource)?;
        Ok(Attempt::Granted)
    }

    fn release_lock(&self, _owner: OwnerId, _resource: &str) -> Result<(), LockError> {
        Ok(())
    }
}
