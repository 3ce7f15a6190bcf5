//! core::scope
//!
//! Scope-bound release tokens.
//!
//! # Architecture
//!
//! A [`ScopeToken`] holds zero-argument callbacks and runs them when it is
//! dropped. Binding a token to a local variable ties the callbacks to that
//! lexical scope: they run on normal return, early return, `?` propagation
//! and panic unwinding alike. Dropping the token early forces them to run
//! immediately.
//!
//! # Invariants
//!
//! - Each registered callback runs exactly once
//! - Callbacks run in registration order
//! - A panicking callback does not prevent the remaining callbacks from running
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use stacklock::core::scope::ScopeToken;
//!
//! let released = Arc::new(AtomicUsize::new(0));
//! {
//!     let counter = Arc::clone(&released);
//!     let _token = ScopeToken::with_callback(move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     });
//!     // ... work while the scope is alive ...
//! }
//! assert_eq!(released.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Runs its callbacks exactly once when dropped.
#[must_use = "dropping a scope token immediately runs its callbacks"]
#[derive(Default)]
pub struct ScopeToken {
    callbacks: Vec<Callback>,
}

impl ScopeToken {
    /// Create a token with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token with one initial callback.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut token = Self::new();
        token.add_callback(callback);
        token
    }

    /// Register another callback to run at end of scope.
    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Number of callbacks still pending.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check if no callbacks are pending.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drop every pending callback without running it.
    ///
    /// Used when the owner performs the release itself through another path
    /// and the token must not repeat it.
    pub(crate) fn disarm(&mut self) {
        self.callbacks.clear();
    }

    fn run_callbacks(&mut self) {
        for (index, callback) in self.callbacks.drain(..).enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!(index, panic = %message, "scope token callback panicked");
            }
        }
    }
}

impl Drop for ScopeToken {
    fn drop(&mut self) {
        self.run_callbacks();
    }
}

impl fmt::Debug for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeToken")
            .field("pending", &self.callbacks.len())
            .finish()
    }
}
