//! stacklock - reentrant multi-level advisory locks
//!
//! stacklock lets many concurrent execution units (threads or tokio tasks)
//! serialize access to named resources using the six DLM lock levels, with
//! reentrant stack-based acquisition and release tied to lexical scope.
//!
//! # Architecture
//!
//! The codebase is layered:
//!
//! - [`core`] - Lock levels, errors, identities, configuration, scope tokens
//! - [`backend`] - Shared lock stores and the optimistic acquire protocol
//! - [`manager`] - Per-unit lock manager, lock handles, execution contexts
//! - [`cli`] - Command-line interface layer
//!
//! # Correctness Invariants
//!
//! stacklock maintains the following invariants:
//!
//! 1. Holders on one resource are pairwise compatible, except for holders
//!    whose lease has run out
//! 2. A failed or timed-out acquire leaves no holder behind
//! 3. A nested acquire never weakens an enclosing frame's level
//! 4. No lock outlives the execution unit that took it, beyond its lease
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stacklock::backend::SharedTableBackend;
//! use stacklock::core::level::LockLevel;
//! use stacklock::manager::{LockDefaults, LockManager};
//!
//! let manager = LockManager::new(Arc::new(SharedTableBackend::new(64, 1024)), LockDefaults::default());
//! let guard = manager.acquire_lock_blocking("inventory", LockLevel::WRITE).unwrap();
//! // ... critical section ...
//! drop(guard);
//! assert_eq!(manager.depth("inventory"), 0);
//! ```

pub mod backend;
pub mod cli;
pub mod core;
pub mod manager;

pub use crate::backend::{create_backend, Backend, SharedTableBackend};
pub use crate::core::config::LockConfig;
pub use crate::core::errors::LockError;
pub use crate::core::level::LockLevel;
pub use crate::manager::{current_manager, spawn_in_unit, Lock, LockContext, LockDefaults, LockManager, ScopedLock};
