//! manager::context
//!
//! One lock manager per execution unit.
//!
//! # Architecture
//!
//! A [`LockContext`] is the shared, cloneable half: the backend every unit
//! acquires through and the default lease and wait budget. Each execution
//! unit gets its own [`LockManager`] from it, so reentrancy stacks are never
//! shared between units.
//!
//! Units are delimited in one of two ways:
//!
//! - explicitly, with [`LockContext::enter`], which returns a [`UnitScope`]
//!   guard to pass down the call chain
//! - ambiently, with [`LockContext::run`] or [`LockContext::spawn`], which bind
//!   a manager to the running tokio task; code inside reaches it through
//!   [`current_manager`]
//!
//! A unit may span several tasks. Tasks started with [`spawn_in_unit`] from
//! inside a unit join it: they see the same manager, so the same owner and
//! the same reentrancy stacks.
//!
//! Either way the unit's locks are released when it ends, including by
//! panic.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stacklock::backend::SharedTableBackend;
//! use stacklock::core::level::LockLevel;
//! use stacklock::manager::{current_manager, LockContext, LockDefaults};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let context = LockContext::new(Arc::new(SharedTableBackend::new(16, 1024)), LockDefaults::default());
//!
//! context
//!     .run(async {
//!         let manager = current_manager().unwrap();
//!         // Left held on purpose: the unit releases it when `run` ends.
//!         let lock = manager
//!             .acquire_unscoped("orders", LockLevel::WRITE, manager.defaults().hold, manager.defaults().wait)
//!             .await
//!             .unwrap();
//!         assert!(lock.is_acquired());
//!     })
//!     .await;
//! # });
//! ```

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::manager::{LockDefaults, LockManager};
use crate::backend::{create_backend, Backend};
use crate::core::config::{ConfigError, LockConfig};
use crate::core::errors::LockError;

tokio::task_local! {
    static CURRENT_MANAGER: Arc<LockManager>;
}

/// Shared settings from which each execution unit gets its own manager.
#[derive(Debug, Clone)]
pub struct LockContext {
    backend: Arc<dyn Backend>,
    defaults: LockDefaults,
}

impl LockContext {
    /// Create a context over `backend`.
    pub fn new(backend: Arc<dyn Backend>, defaults: LockDefaults) -> Self {
        Self { backend, defaults }
    }

    /// Create a context over the backend named by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_config(config: &LockConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(create_backend(config)?, LockDefaults::from(config)))
    }

    /// The shared backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Default lease and wait budget handed to every unit.
    pub fn defaults(&self) -> LockDefaults {
        self.defaults
    }

    /// Start an execution unit with a fresh manager.
    ///
    /// The unit ends, releasing its locks, when the returned guard drops.
    pub fn enter(&self) -> UnitScope {
        let manager = LockManager::new(Arc::clone(&self.backend), self.defaults);
        tracing::debug!(owner = %manager.owner(), "execution unit started");
        UnitScope { manager }
    }

    /// Run `future` as one execution unit bound to the current task.
    pub async fn run<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        let unit = self.enter();
        CURRENT_MANAGER
            .scope(Arc::clone(&unit.manager), future)
            .await
    }

    /// Spawn `future` on a new tokio task as one execution unit.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let context = self.clone();
        tokio::spawn(async move { context.run(future).await })
    }
}

/// The manager bound to the running task by [`LockContext::run`].
///
/// # Errors
///
/// Returns [`LockError::Logic`] outside any execution unit.
pub fn current_manager() -> Result<Arc<LockManager>, LockError> {
    CURRENT_MANAGER.try_with(Arc::clone).map_err(|_| {
        LockError::Logic("no lock manager is bound to the current task".to_string())
    })
}

/// Spawn `future` on a new tokio task that joins the current execution unit.
///
/// The child acquires as the same owner and shares the unit's stacks. When
/// the unit ends its locks are released even if the child is still running;
/// whatever the child acquires afterwards is released once the last handle
/// to the manager is gone.
///
/// # Errors
///
/// Returns [`LockError::Logic`] outside any execution unit.
pub fn spawn_in_unit<F>(future: F) -> Result<JoinHandle<F::Output>, LockError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let manager = current_manager()?;
    tracing::trace!(owner = %manager.owner(), "task joined execution unit");
    Ok(tokio::spawn(CURRENT_MANAGER.scope(manager, future)))
}

/// Guard for one execution unit; derefs to its manager.
#[derive(Debug)]
pub struct UnitScope {
    manager: Arc<LockManager>,
}

impl UnitScope {
    /// A handle to this unit's manager.
    pub fn manager(&self) -> Arc<LockManager> {
        Arc::clone(&self.manager)
    }
}

impl Deref for UnitScope {
    type Target = Arc<LockManager>;

    fn deref(&self) -> &Arc<LockManager> {
        &self.manager
    }
}

impl Drop for UnitScope {
    fn drop(&mut self) {
        let released = self.manager.release_all_own_locks();
        tracing::debug!(owner = %self.manager.owner(), released, "execution unit ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SharedTableBackend;
    use crate::core::level::LockLevel;
    use std::time::Duration;

    fn context() -> (Arc<SharedTableBackend>, LockContext) {
        let backend = Arc::new(SharedTableBackend::new(16, 1024));
        let defaults = LockDefaults {
            hold: Duration::from_secs(30),
            wait: Duration::from_millis(50),
        };
        (backend.clone(), LockContext::new(backend, defaults))
    }

    #[test]
    fn units_get_distinct_owners() {
        let (_backend, context) = context();
        let a = context.enter();
        let b = context.enter();
        assert_ne!(a.owner(), b.owner());
    }

    #[test]
    fn ending_unit_releases_its_locks() {
        let (backend, context) = context();
        let lock = {
            let unit = context.enter();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let defaults = unit.defaults();
            runtime
                .block_on(unit.acquire_unscoped("r", LockLevel::Exclusive, defaults.hold, defaults.wait))
                .unwrap()
        };
        assert!(!lock.is_acquired());
        assert!(backend.table().is_empty());
    }

    #[tokio::test]
    async fn current_manager_outside_unit_is_logic_error() {
        let err = current_manager().unwrap_err();
        assert!(matches!(err, LockError::Logic(_)));
    }

    #[tokio::test]
    async fn run_binds_and_tears_down() {
        let (backend, context) = context();

        let owner = context
            .run(async {
                let manager = current_manager().expect("bound");
                let defaults = manager.defaults();
                let lock = manager
                    .acquire_unscoped("r", LockLevel::WRITE, defaults.hold, defaults.wait)
                    .await
                    .expect("acquire");
                assert!(lock.is_acquired());
                manager.owner()
            })
            .await;

        assert!(backend.table().is_empty());
        assert!(current_manager().is_err());
        assert!(backend.holders("r").unwrap().iter().all(|h| h.owner != owner));
    }

    #[tokio::test]
    async fn child_task_joins_parent_unit() {
        let (backend, context) = context();

        context
            .run(async {
                let parent = current_manager().expect("bound");
                let _read = parent.acquire_lock("r", LockLevel::READ).await.expect("read");

                let child = spawn_in_unit(async {
                    let manager = current_manager().expect("inherited");
                    let depth = manager.depth("r");
                    let write = manager.acquire_lock("r", LockLevel::WRITE).await.expect("nested");
                    let escalated = manager.effective_level("r");
                    write.release().await.expect("release");
                    (manager.owner(), depth, escalated)
                })
                .expect("inside a unit");

                let (owner, depth, escalated) = child.await.unwrap();
                assert_eq!(owner, parent.owner());
                assert_eq!(depth, 1);
                assert_eq!(escalated, Some(LockLevel::WRITE));
                assert_eq!(parent.effective_level("r"), Some(LockLevel::READ));
                assert_eq!(parent.depth("r"), 1);
            })
            .await;

        assert!(backend.table().is_empty());
    }

    #[tokio::test]
    async fn spawn_in_unit_outside_unit_is_logic_error() {
        let err = spawn_in_unit(async {}).unwrap_err();
        assert!(matches!(err, LockError::Logic(_)));
    }

    #[tokio::test]
    async fn spawned_units_are_isolated() {
        let (_backend, context) = context();
        let a = context.spawn(async { current_manager().map(|m| m.owner()) });
        let b = context.spawn(async { current_manager().map(|m| m.owner()) });
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_ne!(a, b);
    }
}
