//! manager
//!
//! Reentrant, scope-bound locking on top of a [`Backend`](crate::backend::Backend).
//!
//! # Modules
//!
//! - [`lock`] - Lock handle for one resource
//! - [`manager`] - Per-unit lock manager and scoped guards
//! - [`context`] - One manager per execution unit

pub mod context;
pub mod lock;
#[allow(clippy::module_inception)]
pub mod manager;

pub use context::{current_manager, spawn_in_unit, LockContext, UnitScope};
pub use lock::Lock;
pub use manager::{work_resource, LockDefaults, LockManager, ScopedLock, WORK_RESOURCE_PREFIX};
