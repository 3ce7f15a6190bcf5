//! manager::manager
//!
//! Per-execution-unit lock coordinator with reentrant acquisition.
//!
//! # Architecture
//!
//! A [`LockManager`] belongs to exactly one execution unit and carries that
//! unit's [`OwnerId`]. For every resource it keeps a stack mirroring nested
//! acquisitions: each nested [`LockManager::acquire_lock`] on a resource
//! pushes an entry and reuses the same [`Lock`]; each
//! [`LockManager::release_lock`] pops one.
//!
//! # Escalation
//!
//! A nested acquire never weakens an enclosing frame's guarantee. The level
//! actually held is `max(requested, enclosing effective level)` by
//! exclusivity, so reading then nested writing holds a write lock, and
//! writing then nested reading keeps the write lock.
//!
//! Popping restores the level of the new top entry using the time left on
//! the lease. Because the compatibility matrix is not monotone (CW and PR
//! conflict), restoring a lower level can itself wait on other units.
//!
//! # Scope binding
//!
//! Acquires return a [`ScopedLock`] whose token pops the entry when the
//! guard is dropped. Drop-driven release is synchronous, so the token uses
//! the blocking release path; call [`ScopedLock::release`] to release
//! cooperatively from async code.
//!
//! # Invariants
//!
//! - Releases pop in nesting order; a release with no entry is a `Logic` error
//! - A guard only pops its own entry; releasing a guard that is not the
//!   innermost is a `Logic` error and leaves the stack untouched
//! - Every entry of one resource's stack shares one `Lock`
//! - Dropping the manager releases everything it still holds
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stacklock::backend::SharedTableBackend;
//! use stacklock::core::level::LockLevel;
//! use stacklock::manager::{LockDefaults, LockManager};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let manager = LockManager::new(Arc::new(SharedTableBackend::new(16, 1024)), LockDefaults::default());
//!
//! let outer = manager.acquire_lock("orders", LockLevel::READ).await.unwrap();
//! {
//!     let _inner = manager.acquire_lock("orders", LockLevel::WRITE).await.unwrap();
//!     assert_eq!(manager.effective_level("orders"), Some(LockLevel::WRITE));
//! }
//! assert_eq!(manager.effective_level("orders"), Some(LockLevel::READ));
//! outer.release().await.unwrap();
//! assert_eq!(manager.depth("orders"), 0);
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::lock::Lock;
use crate::backend::{create_backend, Backend};
use crate::core::config::{ConfigError, LockConfig};
use crate::core::errors::{validate_resource, LockError};
use crate::core::level::LockLevel;
use crate::core::owner::OwnerId;
use crate::core::scope::ScopeToken;

/// Prefix of resource names derived from work units.
pub const WORK_RESOURCE_PREFIX: &str = "work:";

/// Lease and wait budget used when a call does not give its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDefaults {
    /// Lease length.
    pub hold: Duration,
    /// Wait budget.
    pub wait: Duration,
}

impl Default for LockDefaults {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockDefaults {
    fn from(config: &LockConfig) -> Self {
        Self {
            hold: config.default_hold(),
            wait: config.default_wait(),
        }
    }
}

#[derive(Debug)]
struct StackEntry {
    id: u64,
    lock: Arc<Lock>,
    requested: LockLevel,
    effective: LockLevel,
}

/// What popping a stack entry leaves behind.
enum Popped {
    /// The stack is gone; release the lock outright.
    Last(Arc<Lock>),
    /// An enclosing frame remains; bring the lock back to its level.
    Restore { lock: Arc<Lock>, level: LockLevel },
}

/// Lock coordinator for one execution unit.
#[derive(Debug)]
pub struct LockManager {
    backend: Arc<dyn Backend>,
    owner: OwnerId,
    defaults: LockDefaults,
    stacks: Mutex<HashMap<String, Vec<StackEntry>>>,
    next_entry: AtomicU64,
    this: Weak<LockManager>,
}

impl LockManager {
    /// Create a manager with a freshly allocated owner identity.
    pub fn new(backend: Arc<dyn Backend>, defaults: LockDefaults) -> Arc<Self> {
        Self::with_owner(backend, defaults, OwnerId::next())
    }

    /// Create a manager acting as `owner`.
    pub fn with_owner(backend: Arc<dyn Backend>, defaults: LockDefaults, owner: OwnerId) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            backend,
            owner,
            defaults,
            stacks: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Create a manager over the backend named by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_config(config: &LockConfig) -> Result<Arc<Self>, ConfigError> {
        Ok(Self::new(create_backend(config)?, LockDefaults::from(config)))
    }

    /// The identity this manager acquires as.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The backend this manager acquires through.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Default lease and wait budget.
    pub fn defaults(&self) -> LockDefaults {
        self.defaults
    }

    /// Acquire `resource` at `level` with the default lease and wait budget.
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidArgument`] for an empty resource
    /// - [`LockError::Unavailable`] on timeout or a corrupted record
    /// - the backend's capacity errors
    pub async fn acquire_lock(&self, resource: &str, level: LockLevel) -> Result<ScopedLock, LockError> {
        self.acquire_lock_with(resource, level, self.defaults.hold, self.defaults.wait)
            .await
    }

    /// Acquire `resource` at `level` with an explicit lease and wait budget.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire_lock`].
    pub async fn acquire_lock_with(
        &self,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<ScopedLock, LockError> {
        let (lock, effective) = self.prepare(resource, level, hold, wait)?;
        lock.acquire_within(effective, hold, wait).await?;
        let entry = self.push(resource, &lock, level, effective);
        Ok(self.bind(lock, entry))
    }

    /// Blocking twin of [`LockManager::acquire_lock`].
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire_lock`].
    pub fn acquire_lock_blocking(&self, resource: &str, level: LockLevel) -> Result<ScopedLock, LockError> {
        self.acquire_lock_blocking_with(resource, level, self.defaults.hold, self.defaults.wait)
    }

    /// Blocking twin of [`LockManager::acquire_lock_with`].
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire_lock`].
    pub fn acquire_lock_blocking_with(
        &self,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<ScopedLock, LockError> {
        let (lock, effective) = self.prepare(resource, level, hold, wait)?;
        lock.acquire_blocking_within(effective, hold, wait)?;
        let entry = self.push(resource, &lock, level, effective);
        Ok(self.bind(lock, entry))
    }

    /// Acquire without binding the release to a scope.
    ///
    /// The entry stays on the stack until [`LockManager::release_lock`] is
    /// called for `resource` or the manager releases everything.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire_lock`].
    pub async fn acquire_unscoped(
        &self,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<Arc<Lock>, LockError> {
        let (lock, effective) = self.prepare(resource, level, hold, wait)?;
        lock.acquire_within(effective, hold, wait).await?;
        self.push(resource, &lock, level, effective);
        Ok(lock)
    }

    /// Pop the innermost acquisition of `resource`.
    ///
    /// With an enclosing acquisition left, the lock returns to that frame's
    /// level; otherwise it is released.
    ///
    /// # Errors
    ///
    /// - [`LockError::Logic`] if nothing is acquired on `resource`
    /// - errors from restoring the enclosing level; the lock then stays at
    ///   the higher level until released
    pub async fn release_lock(&self, resource: &str) -> Result<(), LockError> {
        self.release_entry(resource, None).await
    }

    /// Blocking twin of [`LockManager::release_lock`].
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::release_lock`].
    pub fn release_lock_blocking(&self, resource: &str) -> Result<(), LockError> {
        self.release_entry_blocking(resource, None)
    }

    async fn release_entry(&self, resource: &str, entry: Option<u64>) -> Result<(), LockError> {
        match self.pop(resource, entry)? {
            Popped::Last(lock) => lock.release(),
            Popped::Restore { lock, level } => {
                if lock.level() == level {
                    return Ok(());
                }
                tracing::debug!(resource, from = %lock.level(), to = %level, "restoring enclosing lock level");
                let lease = lock.remaining_lease().unwrap_or(Duration::ZERO);
                lock.acquire_within(level, lease, lock.wait()).await
            }
        }
    }

    fn release_entry_blocking(&self, resource: &str, entry: Option<u64>) -> Result<(), LockError> {
        match self.pop(resource, entry)? {
            Popped::Last(lock) => lock.release(),
            Popped::Restore { lock, level } => {
                if lock.level() == level {
                    return Ok(());
                }
                tracing::debug!(resource, from = %lock.level(), to = %level, "restoring enclosing lock level");
                let lease = lock.remaining_lease().unwrap_or(Duration::ZERO);
                lock.acquire_blocking_within(level, lease, lock.wait())
            }
        }
    }

    /// Run `work` while holding a lock keyed by the identity of `work`.
    ///
    /// The lock is released on every exit path, including a panic in
    /// `work` and cancellation of the returned future.
    ///
    /// # Errors
    ///
    /// Any acquire or release error; `work`'s own output is returned as is.
    pub async fn execute_with_lock<F, Fut, T>(&self, level: LockLevel, work: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let resource = work_resource::<F>();
        self.execute_with_lock_on(&resource, level, work).await
    }

    /// Run `work` while holding `resource` at `level`.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::execute_with_lock`].
    pub async fn execute_with_lock_on<F, Fut, T>(
        &self,
        resource: &str,
        level: LockLevel,
        work: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_lock(resource, level).await?;
        let output = work().await;
        guard.release().await?;
        Ok(output)
    }

    /// Blocking twin of [`LockManager::execute_with_lock`].
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::execute_with_lock`].
    pub fn execute_with_lock_blocking<F, T>(&self, level: LockLevel, work: F) -> Result<T, LockError>
    where
        F: FnOnce() -> T,
    {
        let resource = work_resource::<F>();
        let guard = self.acquire_lock_blocking(&resource, level)?;
        let output = work();
        guard.release_blocking()?;
        Ok(output)
    }

    /// Force-release every lock this manager still holds and forget all
    /// stacks. Returns the number of locks released.
    ///
    /// Run when the execution unit ends. Release failures are logged, not
    /// returned; the leases bound how long such holders linger.
    pub fn release_all_own_locks(&self) -> usize {
        let stacks = mem::take(&mut *self.stacks());
        let mut released = 0;

        for (resource, entries) in stacks {
            let Some(entry) = entries.first() else {
                continue;
            };
            if !entry.lock.is_acquired() {
                continue;
            }
            match entry.lock.release() {
                Ok(()) => released += 1,
                Err(error) => {
                    tracing::warn!(resource = %resource, %error, "failed to release lock at unit end");
                }
            }
        }

        if released > 0 {
            tracing::debug!(owner = %self.owner, released, "released remaining locks");
        }
        released
    }

    /// Level currently held on `resource`, if any.
    pub fn effective_level(&self, resource: &str) -> Option<LockLevel> {
        self.stacks()
            .get(resource)
            .and_then(|stack| stack.last())
            .map(|entry| entry.effective)
    }

    /// Number of nested acquisitions of `resource`.
    pub fn depth(&self, resource: &str) -> usize {
        self.stacks().get(resource).map_or(0, Vec::len)
    }

    /// Levels originally requested by each nested acquisition of
    /// `resource`, outermost first.
    pub fn requested_levels(&self, resource: &str) -> Vec<LockLevel> {
        self.stacks()
            .get(resource)
            .map(|stack| stack.iter().map(|entry| entry.requested).collect())
            .unwrap_or_default()
    }

    /// Resources with at least one acquisition, sorted.
    pub fn held_resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.stacks().keys().cloned().collect();
        resources.sort();
        resources
    }

    /// Find or create the lock for `resource` and compute the level to hold.
    fn prepare(
        &self,
        resource: &str,
        level: LockLevel,
        hold: Duration,
        wait: Duration,
    ) -> Result<(Arc<Lock>, LockLevel), LockError> {
        validate_resource(resource)?;

        if let Some(top) = self.stacks().get(resource).and_then(|stack| stack.last()) {
            let effective = level.escalate(top.effective);
            if effective != top.effective {
                tracing::debug!(resource, from = %top.effective, to = %effective, "escalating nested lock");
            }
            return Ok((Arc::clone(&top.lock), effective));
        }

        let lock = Lock::new(Arc::clone(&self.backend), self.owner, resource, level, hold, wait)?;
        Ok((Arc::new(lock), level))
    }

    /// Push a stack entry and return its id.
    fn push(&self, resource: &str, lock: &Arc<Lock>, requested: LockLevel, effective: LockLevel) -> u64 {
        let id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        self.stacks()
            .entry(resource.to_string())
            .or_default()
            .push(StackEntry {
                id,
                lock: Arc::clone(lock),
                requested,
                effective,
            });
        id
    }

    /// Pop the top entry of `resource`. With `expected` set, the top entry
    /// must be that one; otherwise nothing is popped.
    fn pop(&self, resource: &str, expected: Option<u64>) -> Result<Popped, LockError> {
        let mut stacks = self.stacks();
        let stack = stacks
            .get_mut(resource)
            .filter(|stack| !stack.is_empty())
            .ok_or_else(|| LockError::Logic(format!("release of '{}' without a matching acquire", resource)))?;

        if let Some(id) = expected {
            if stack.last().map(|top| top.id) != Some(id) {
                let nested = stack.iter().any(|entry| entry.id == id);
                return Err(LockError::Logic(if nested {
                    format!("release of '{}' out of nesting order", resource)
                } else {
                    format!("release of '{}' by a guard whose acquisition is gone", resource)
                }));
            }
        }
        let popped = stack.pop().ok_or_else(|| {
            LockError::Logic(format!("release of '{}' without a matching acquire", resource))
        })?;

        match stack.last() {
            Some(top) => Ok(Popped::Restore {
                lock: Arc::clone(&top.lock),
                level: top.effective,
            }),
            None => {
                stacks.remove(resource);
                Ok(Popped::Last(popped.lock))
            }
        }
    }

    fn bind(&self, lock: Arc<Lock>, entry: u64) -> ScopedLock {
        let resource = lock.resource().to_string();
        let manager = self.this.clone();
        let token = ScopeToken::with_callback({
            let manager = manager.clone();
            let resource = resource.clone();
            move || {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if let Err(error) = manager.release_entry_blocking(&resource, Some(entry)) {
                    tracing::warn!(resource = %resource, %error, "scoped lock release failed");
                }
            }
        });
        ScopedLock {
            lock,
            entry,
            token,
            manager,
        }
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<String, Vec<StackEntry>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release_all_own_locks();
    }
}

/// Resource name under which [`LockManager::execute_with_lock`] serializes
/// work of type `F`.
pub fn work_resource<F>() -> String {
    let digest = Sha256::digest(std::any::type_name::<F>().as_bytes());
    format!("{}{}", WORK_RESOURCE_PREFIX, hex::encode(digest))
}

/// An acquired lock whose release is bound to this guard's scope.
///
/// Dropping the guard pops the acquisition from the manager's stack.
#[must_use = "dropping a scoped lock immediately releases it"]
pub struct ScopedLock {
    lock: Arc<Lock>,
    entry: u64,
    token: ScopeToken,
    manager: Weak<LockManager>,
}

impl ScopedLock {
    /// The underlying lock handle.
    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    /// Release cooperatively instead of on drop.
    ///
    /// # Errors
    ///
    /// - [`LockError::Logic`] if a later acquisition of the same resource is
    ///   still open, or this guard's acquisition was already popped; the
    ///   stack and the backend are left unchanged
    /// - otherwise the same as [`LockManager::release_lock`]
    pub async fn release(mut self) -> Result<(), LockError> {
        self.token.disarm();
        match self.manager.upgrade() {
            Some(manager) => manager.release_entry(self.lock.resource(), Some(self.entry)).await,
            None => self.lock.release(),
        }
    }

    /// Release now, blocking the thread if the enclosing level must wait.
    ///
    /// # Errors
    ///
    /// Same as [`ScopedLock::release`].
    pub fn release_blocking(mut self) -> Result<(), LockError> {
        self.token.disarm();
        match self.manager.upgrade() {
            Some(manager) => manager.release_entry_blocking(self.lock.resource(), Some(self.entry)),
            None => self.lock.release(),
        }
    }
}

impl Deref for ScopedLock {
    type Target = Lock;

    fn deref(&self) -> &Lock {
        &self.lock
    }
}

impl fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLock")
            .field("resource", &self.lock.resource())
            .field("level", &self.lock.level())
            .field("token", &self.token)
            .finish()
    }
}
