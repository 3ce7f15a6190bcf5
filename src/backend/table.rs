//! backend::table
//!
//! Fixed-capacity concurrent key→row table shared by every execution unit.
//!
//! # Architecture
//!
//! Keys are spread over independently locked shards so that units working on
//! different resources rarely touch the same mutex. Rows are opaque byte
//! blobs bounded by a fixed row size; the table knows nothing about lock
//! records.
//!
//! # Invariants
//!
//! - Every single-key operation (`get`, `set`, `delete`, `compare_and_swap`)
//!   is atomic
//! - The number of keys never exceeds the capacity given at construction
//! - No row is longer than the row size given at construction
//!
//! Reads followed by writes are *not* atomic; callers that need a
//! read-modify-write use [`SharedTable::compare_and_swap`].
//!
//! # Example
//!
//! ```
//! use stacklock::backend::SharedTable;
//!
//! let table = SharedTable::new(2, 64);
//! table.set("a", b"1").unwrap();
//! assert_eq!(table.get("a").as_deref(), Some(&b"1"[..]));
//! assert!(table.compare_and_swap("a", Some(&b"1"[..]), Some(&b"2"[..])).unwrap());
//! assert!(!table.compare_and_swap("a", Some(&b"1"[..]), None).unwrap());
//! ```

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Number of independently locked shards.
const SHARD_COUNT: usize = 16;

/// Errors from table writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    /// A new key was written while the table was at capacity.
    #[error("table is full ({capacity} rows)")]
    Full {
        /// Configured capacity
        capacity: usize,
    },

    /// The value does not fit in a row.
    #[error("row of {size} bytes exceeds the {limit} byte limit")]
    RowTooLarge {
        /// Value size in bytes
        size: usize,
        /// Row size in bytes
        limit: usize,
    },
}

type Shard = HashMap<String, Box<[u8]>>;

/// A fixed-capacity concurrent key→row table.
pub struct SharedTable {
    shards: Vec<Mutex<Shard>>,
    capacity: usize,
    row_size: usize,
    rows: AtomicUsize,
}

impl SharedTable {
    /// Create a table holding at most `capacity` keys of at most `row_size`
    /// bytes each.
    pub fn new(capacity: usize, row_size: usize) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            capacity,
            row_size,
            rows: AtomicUsize::new(0),
        }
    }

    /// Maximum number of keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum row length in bytes.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Current number of keys.
    pub fn len(&self) -> usize {
        self.rows.load(Ordering::Acquire)
    }

    /// Check if the table holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).contains_key(key)
    }

    /// Read the row stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.shard(key).get(key).map(|row| row.to_vec())
    }

    /// Unconditionally store `value` under `key`.
    ///
    /// # Errors
    ///
    /// - [`TableError::RowTooLarge`] if `value` exceeds the row size
    /// - [`TableError::Full`] if `key` is new and the table is at capacity
    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), TableError> {
        self.check_row(value)?;
        let mut shard = self.shard(key);
        self.write(&mut shard, key, value)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut shard = self.shard(key);
        self.remove(&mut shard, key)
    }

    /// Replace the row under `key` only if it currently equals `expected`.
    ///
    /// `expected == None` means "key absent"; `new == None` deletes the key.
    /// Returns `Ok(false)` without writing if the current row differs.
    ///
    /// # Errors
    ///
    /// Same as [`SharedTable::set`]; nothing is written on error.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, TableError> {
        if let Some(value) = new {
            self.check_row(value)?;
        }

        let mut shard = self.shard(key);
        if shard.get(key).map(|row| &row[..]) != expected {
            return Ok(false);
        }

        match new {
            Some(value) => self.write(&mut shard, key, value)?,
            None => {
                self.remove(&mut shard, key);
            }
        }
        Ok(true)
    }

    /// Snapshot of every key currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn check_row(&self, value: &[u8]) -> Result<(), TableError> {
        if value.len() > self.row_size {
            return Err(TableError::RowTooLarge {
                size: value.len(),
                limit: self.row_size,
            });
        }
        Ok(())
    }

    fn write(&self, shard: &mut Shard, key: &str, value: &[u8]) -> Result<(), TableError> {
        match shard.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(value.into());
            }
            Entry::Vacant(slot) => {
                self.reserve_row()?;
                slot.insert(value.into());
            }
        }
        Ok(())
    }

    fn remove(&self, shard: &mut Shard, key: &str) -> bool {
        let removed = shard.remove(key).is_some();
        if removed {
            self.rows.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn reserve_row(&self) -> Result<(), TableError> {
        self.rows
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |rows| {
                (rows < self.capacity).then_some(rows + 1)
            })
            .map(|_| ())
            .map_err(|_| TableError::Full {
                capacity: self.capacity,
            })
    }

    fn shard(&self, key: &str) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SharedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTable")
            .field("rows", &self.len())
            .field("capacity", &self.capacity)
            .field("row_size", &self.row_size)
            .finish()
    }
}
