//! core::owner
//!
//! Identity of an execution unit as it appears in the shared lock table.
//!
//! An owner is the pair `(process_id, unit_id)`. The process id separates
//! workers attached to the same table; the unit id separates execution units
//! (threads, tasks, requests) inside one process. Each [`LockManager`]
//! carries exactly one owner id, and backends only ever remove holders that
//! match the caller's owner id.
//!
//! [`LockManager`]: crate::manager::LockManager

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Next unit id handed out by [`OwnerId::next`]. Zero is never issued.
static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// The owner of a holder entry in the shared lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId {
    /// OS process id of the worker.
    pub process_id: u32,
    /// Execution unit id, unique within the process.
    pub unit_id: u64,
}

impl OwnerId {
    /// Create an owner id from explicit parts.
    pub fn new(process_id: u32, unit_id: u64) -> Self {
        Self {
            process_id,
            unit_id,
        }
    }

    /// Allocate a fresh owner id for a new execution unit in this process.
    pub fn next() -> Self {
        Self::new(
            std::process::id(),
            NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
        )
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process_id, self.unit_id)
    }
}
