//! backend::traits
//!
//! Backend trait definition.
//!
//! # Design
//!
//! A backend is a store shared by every execution unit that wants to see the
//! same locks. Implementations provide two primitives:
//!
//! - [`Backend::try_acquire`]: one compatibility-checked attempt, never waits
//! - [`Backend::release_lock`]: remove the caller's own holder entry
//!
//! The waiting policy lives in the provided methods. [`Backend::acquire_lock`]
//! suspends cooperatively between attempts (tokio sleep), so sibling tasks on
//! the same runtime thread keep running. [`Backend::acquire_lock_blocking`]
//! parks the OS thread instead, for thread-per-unit hosts and for release
//! paths that run inside `Drop`.
//!
//! Both loops attempt, compare the elapsed time against the wait budget,
//! then sleep for `min(wait_step, remaining)`. A timeout is reported only
//! once the full budget has elapsed, and never more than one wait step
//! after it.
//!
//! # Example
//!
//! ```ignore
//! use stacklock::backend::Backend;
//!
//! async fn guarded(backend: &dyn Backend, owner: OwnerId) -> Result<(), LockError> {
//!     backend
//!         .acquire_lock(owner, "orders", LockLevel::WRITE, hold, wait)
//!         .await?;
//!     // ... critical section ...
//!     backend.release_lock(owner, "orders")
//! }
//! ```

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core::errors::LockError;
use crate::core::level::LockLevel;
use crate::core::owner::OwnerId;

/// Default pause between attempts (1 ms).
pub const DEFAULT_WAIT_STEP: Duration = Duration::from_millis(1);

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The holder entry was written and verified.
    Granted,
    /// An incompatible holder is active, or another unit won the write race.
    Contended,
}

/// Trait for shared lock stores.
///
/// Implementations must be thread-safe (Send + Sync). A failed or contended
/// attempt must leave no holder entry for the caller behind.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Short name for diagnostics (e.g. "table").
    fn name(&self) -> &'static str;

    /// Make one attempt to add `owner` as a holder of `resource` at `level`
    /// with a lease of `hold`.
    ///
    /// Any existing holder entry of `owner` on `resource` is replaced, so a
    /// reacquire never waits on the caller itself.
    ///
    /// # Errors
    ///
    /// - [`LockError::Unavailable`] if the stored record was corrupted
    /// - [`LockError::ResourceExhausted`] if the store has no room
    /// - [`LockError::CapacityExceeded`] if the record would not fit
    fn try_acquire(
        &self,
        owner: OwnerId,
        resource: &str,
        level: LockLevel,
        hold: Duration,
    ) -> Result<Attempt, LockError>;

    /// Remove the holder entry of `owner` on `resource`.
    ///
    /// Never touches other owners' entries. Releasing something that is not
    /// held is a no-op.
    fn release_lock(&self, owner: OwnerId, resource: &str) -> Result<(), LockError>;

    /// Pause between attempts while waiting.
    fn wait_step(&self) -> Duration {
        DEFAULT_WAIT_STEP
    }

    /// Acquire `resource` at `level`, suspending cooperatively until it is
    /// granted or `wait` has elapsed.
    ///
    /// # Errors
    ///
    /// [`LockError::Unavailable`] with a timeout reason once `wait` is spent,
    /// plus anything [`Backend::try_acquire`] reports.
    async fn acquire_lock(
        &self,
        owner: OwnerId,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        loop {
            if self.try_acquire(owner, resource, level, hold)? == Attempt::Granted {
                return Ok(());
            }
            let pause = next_pause(started, wait, self.wait_step(), resource, level)?;
            tokio::time::sleep(pause).await;
        }
    }

    /// Acquire `resource` at `level`, blocking the current thread until it
    /// is granted or `wait` has elapsed.
    ///
    /// # Errors
    ///
    /// Same as [`Backend::acquire_lock`].
    fn acquire_lock_blocking(
        &self,
        owner: OwnerId,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        loop {
            if self.try_acquire(owner, resource, level, hold)? == Attempt::Granted {
                return Ok(());
            }
            let pause = next_pause(started, wait, self.wait_step(), resource, level)?;
            thread::sleep(pause);
        }
    }
}

/// How long to sleep before the next attempt, or the timeout error once the
/// wait budget is spent.
fn next_pause(
    started: Instant,
    wait: Duration,
    step: Duration,
    resource: &str,
    level: LockLevel,
) -> Result<Duration, LockError> {
    let waited = started.elapsed();
    if waited >= wait {
        return Err(LockError::timeout(resource, level, waited));
    }
    Ok(step.min(wait - waited))
}
