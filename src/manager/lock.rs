//! manager::lock
//!
//! Lock handle: one execution unit's claim on one resource.
//!
//! # Architecture
//!
//! A [`Lock`] pairs a resource name with the backend that stores it and
//! tracks what this unit believes about its claim: the current level, the
//! lease, and when it was acquired or released. All waiting happens inside
//! the backend; the handle only records outcomes.
//!
//! # Invariants
//!
//! - `is_acquired()` only changes on a successful acquire or on release
//! - `release()` is idempotent
//! - The state mutex is never held across a backend call
//! - Dropping an acquired lock releases it (best effort)
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stacklock::backend::{Backend, SharedTableBackend};
//! use stacklock::core::level::LockLevel;
//! use stacklock::core::owner::OwnerId;
//! use stacklock::manager::Lock;
//!
//! let backend: Arc<dyn Backend> = Arc::new(SharedTableBackend::new(16, 256));
//! let lock = Lock::new(
//!     backend,
//!     OwnerId::next(),
//!     "orders",
//!     LockLevel::WRITE,
//!     Duration::from_secs(30),
//!     Duration::from_secs(1),
//! )
//! .unwrap();
//!
//! lock.acquire_blocking(LockLevel::WRITE, Duration::from_secs(30)).unwrap();
//! assert!(lock.is_valid());
//! lock.release().unwrap();
//! lock.release().unwrap();
//! assert!(!lock.is_acquired());
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backend::Backend;
use crate::core::errors::{validate_resource, LockError};
use crate::core::level::LockLevel;
use crate::core::owner::OwnerId;

#[derive(Debug, Clone)]
struct LockState {
    level: LockLevel,
    hold: Duration,
    acquired: bool,
    created_at: DateTime<Utc>,
    first_acquired_at: Option<DateTime<Utc>>,
    last_acquired_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

/// A lock on one resource held (or releasable) by one execution unit.
#[derive(Debug)]
pub struct Lock {
    backend: Arc<dyn Backend>,
    owner: OwnerId,
    resource: String,
    wait: Duration,
    state: Mutex<LockState>,
}

impl Lock {
    /// Create a lock handle that is not yet acquired.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] for an empty resource name.
    pub fn new(
        backend: Arc<dyn Backend>,
        owner: OwnerId,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<Self, LockError> {
        validate_resource(resource)?;
        Ok(Self {
            backend,
            owner,
            resource: resource.to_string(),
            wait,
            state: Mutex::new(LockState {
                level,
                hold,
                acquired: false,
                created_at: Utc::now(),
                first_acquired_at: None,
                last_acquired_at: None,
                released_at: None,
            }),
        })
    }

    /// Create a lock handle and acquire it immediately.
    ///
    /// # Errors
    ///
    /// Anything [`Lock::new`] or [`Lock::acquire`] reports.
    pub async fn acquired(
        backend: Arc<dyn Backend>,
        owner: OwnerId,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<Self, LockError> {
        let lock = Self::new(backend, owner, resource, level, hold, wait)?;
        lock.acquire(level, hold).await?;
        Ok(lock)
    }

    /// Acquire, reacquire, extend or change the level of this lock, waiting
    /// cooperatively up to the lock's wait budget.
    ///
    /// # Errors
    ///
    /// [`LockError::Unavailable`] on timeout or a corrupted record, plus the
    /// capacity errors of the backend.
    pub async fn acquire(&self, level: LockLevel, hold: Duration) -> Result<(), LockError> {
        self.acquire_within(level, hold, self.wait).await
    }

    /// Blocking twin of [`Lock::acquire`].
    ///
    /// # Errors
    ///
    /// Same as [`Lock::acquire`].
    pub fn acquire_blocking(&self, level: LockLevel, hold: Duration) -> Result<(), LockError> {
        self.acquire_blocking_within(level, hold, self.wait)
    }

    pub(crate) async fn acquire_within(
        &self,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<(), LockError> {
        self.backend
            .acquire_lock(self.owner, &self.resource, level, hold, wait)
            .await?;
        self.mark_acquired(level, hold);
        Ok(())
    }

    pub(crate) fn acquire_blocking_within(
        &self,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<(), LockError> {
        self.backend
            .acquire_lock_blocking(self.owner, &self.resource, level, hold, wait)?;
        self.mark_acquired(level, hold);
        Ok(())
    }

    /// Release the lock. A no-op if it is not acquired.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the lock then stays marked acquired.
    pub fn release(&self) -> Result<(), LockError> {
        if !self.state().acquired {
            return Ok(());
        }
        self.backend.release_lock(self.owner, &self.resource)?;

        let mut state = self.state();
        state.acquired = false;
        state.released_at = Some(Utc::now());
        Ok(())
    }

    /// Check if the lock has been acquired and not released since.
    ///
    /// Says nothing about the lease; see [`Lock::is_valid`].
    pub fn is_acquired(&self) -> bool {
        self.state().acquired
    }

    /// Check if the lock is acquired and its lease has not lapsed.
    pub fn is_valid(&self) -> bool {
        self.remaining_lease().is_some_and(|left| !left.is_zero())
    }

    /// Time left on the lease, or `None` if the lock is not acquired.
    ///
    /// A lapsed lease reports zero.
    pub fn remaining_lease(&self) -> Option<Duration> {
        let state = self.state();
        if !state.acquired {
            return None;
        }
        let since = state.last_acquired_at?;
        let elapsed = (Utc::now() - since).to_std().unwrap_or(Duration::ZERO);
        Some(state.hold.saturating_sub(elapsed))
    }

    /// The owner this lock acquires for.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The locked resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current (or last requested) level.
    pub fn level(&self) -> LockLevel {
        self.state().level
    }

    /// Current lease length.
    pub fn hold(&self) -> Duration {
        self.state().hold
    }

    /// Wait budget for acquire calls.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// When the handle was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.state().created_at
    }

    /// When the lock was first acquired.
    pub fn first_acquired_at(&self) -> Option<DateTime<Utc>> {
        self.state().first_acquired_at
    }

    /// When the lock was most recently acquired or reacquired.
    pub fn last_acquired_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_acquired_at
    }

    /// When the lock was most recently released.
    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        self.state().released_at
    }

    fn mark_acquired(&self, level: LockLevel, hold: Duration) {
        let now = Utc::now();
        let mut state = self.state();
        state.level = level;
        state.hold = hold;
        state.acquired = true;
        state.first_acquired_at.get_or_insert(now);
        state.last_acquired_at = Some(now);
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        // Best-effort release on drop - ignore errors since we're dropping
        let _ = self.release();
    }
}
