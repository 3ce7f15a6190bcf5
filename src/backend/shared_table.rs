//! backend::shared_table
//!
//! Lock backend over a [`SharedTable`].
//!
//! # Architecture
//!
//! Every resource maps to one table row holding its encoded [`LockRecord`].
//! There is no central arbiter: each execution unit mutates rows directly
//! using an optimistic read → sweep → check → write → verify attempt.
//!
//! # Acquire attempt
//!
//! 1. Read the row (absent ⇒ no holders).
//! 2. Decode it. A damaged or invalid row is reported, deleted, and the
//!    attempt fails with [`LockError::Unavailable`] (`CorruptedRecord`).
//! 3. Sweep expired holders and the caller's own holder.
//! 4. If any remaining holder is incompatible with the requested level the
//!    attempt is contended.
//! 5. Append the caller's holder and write the row with a compare-and-swap
//!    against the bytes read in step 1. A lost swap is a contended attempt.
//! 6. Read the row back. The attempt wins if the bytes are ours, or if a
//!    later writer built on our record and our holder is still present.
//!
//! Contended attempts write nothing, so a caller that gives up leaves no
//! holder behind. Waiting between attempts is done by the provided loops of
//! [`Backend`].
//!
//! # Release
//!
//! Remove the caller's holder with a compare-and-swap retry loop; delete the
//! row when no holder remains. A damaged row is deleted outright, which also
//! drops any other holders stored in it.
//!
//! # Invariants
//!
//! - Rows are only ever mutated through compare-and-swap
//! - An empty record is never stored
//! - Only the caller's own holder is removed on release
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stacklock::backend::{Attempt, Backend, SharedTableBackend};
//! use stacklock::core::level::LockLevel;
//! use stacklock::core::owner::OwnerId;
//!
//! let backend = SharedTableBackend::new(100, 1024);
//! let (a, b) = (OwnerId::next(), OwnerId::next());
//! let hold = Duration::from_secs(10);
//!
//! assert_eq!(backend.try_acquire(a, "orders", LockLevel::READ, hold).unwrap(), Attempt::Granted);
//! assert_eq!(backend.try_acquire(b, "orders", LockLevel::WRITE, hold).unwrap(), Attempt::Contended);
//! backend.release_lock(a, "orders").unwrap();
//! assert!(backend.table().is_empty());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::Level;

use super::record::{Holder, LockRecord, RecordError};
use super::table::{SharedTable, TableError};
use super::traits::{Attempt, Backend, DEFAULT_WAIT_STEP};
use crate::core::clock;
use crate::core::config::schema::MIN_WAIT_STEP_US;
use crate::core::config::{ConfigError, LockConfig};
use crate::core::errors::{validate_resource, LockError};
use crate::core::level::LockLevel;
use crate::core::owner::OwnerId;

/// Running counters of backend activity.
#[derive(Debug, Default)]
struct BackendStats {
    granted: AtomicU64,
    contended: AtomicU64,
    lost_races: AtomicU64,
    corrupted: AtomicU64,
    expired_swept: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time copy of the backend counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Attempts that wrote and verified a holder.
    pub granted: u64,
    /// Attempts refused because an incompatible holder was active.
    pub contended: u64,
    /// Attempts that lost the optimistic write race.
    pub lost_races: u64,
    /// Damaged or invalid records detected and deleted.
    pub corrupted: u64,
    /// Expired holders removed by sweeps.
    pub expired_swept: u64,
    /// Holder entries removed by release.
    pub released: u64,
}

/// Lock backend storing records in a shared fixed-capacity table.
#[derive(Debug)]
pub struct SharedTableBackend {
    table: Arc<SharedTable>,
    wait_step: Duration,
    report_level: Level,
    stats: BackendStats,
}

impl SharedTableBackend {
    /// Create a backend over a fresh table of `capacity` resources with at
    /// most `max_record_bytes` per record.
    pub fn new(capacity: usize, max_record_bytes: usize) -> Self {
        Self::attach(Arc::new(SharedTable::new(capacity, max_record_bytes)))
    }

    /// Create a backend over an existing table.
    ///
    /// Several backends attached to one table see each other's locks.
    pub fn attach(table: Arc<SharedTable>) -> Self {
        Self {
            table,
            wait_step: DEFAULT_WAIT_STEP,
            report_level: Level::ERROR,
            stats: BackendStats::default(),
        }
    }

    /// Create a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_config(config: &LockConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.table_capacity, config.max_record_bytes)
            .with_wait_step(config.wait_step())
            .with_report_level(config.corruption_log_level()?))
    }

    /// Set the pause between acquire attempts, raised to at least
    /// [`MIN_WAIT_STEP_US`] microseconds.
    pub fn with_wait_step(mut self, wait_step: Duration) -> Self {
        self.wait_step = wait_step.max(Duration::from_micros(MIN_WAIT_STEP_US));
        self
    }

    /// Set the severity used to report damaged records.
    pub fn with_report_level(mut self, level: Level) -> Self {
        self.report_level = level;
        self
    }

    /// The underlying table.
    pub fn table(&self) -> &Arc<SharedTable> {
        &self.table
    }

    /// Current activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            granted: self.stats.granted.load(Ordering::Relaxed),
            contended: self.stats.contended.load(Ordering::Relaxed),
            lost_races: self.stats.lost_races.load(Ordering::Relaxed),
            corrupted: self.stats.corrupted.load(Ordering::Relaxed),
            expired_swept: self.stats.expired_swept.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
        }
    }

    /// Decode the stored record of `resource`, if any.
    ///
    /// # Errors
    ///
    /// Returns the decode error for a damaged row; the row is left as is.
    pub fn record(&self, resource: &str) -> Result<Option<LockRecord>, RecordError> {
        self.table
            .get(resource)
            .map(|bytes| LockRecord::decode(&bytes))
            .transpose()
    }

    /// The stored holders of `resource`, including any whose lease has run
    /// out but that no sweep has removed yet.
    ///
    /// # Errors
    ///
    /// Returns the decode error for a damaged row.
    pub fn holders(&self, resource: &str) -> Result<Vec<Holder>, RecordError> {
        Ok(self
            .record(resource)?
            .map(|record| record.holders().to_vec())
            .unwrap_or_default())
    }

    /// Sweep every row, dropping expired holders and deleting emptied
    /// records. Damaged rows found on the way are discarded.
    ///
    /// Returns the number of expired holders removed.
    pub fn collect_expired(&self) -> usize {
        let now = clock::now_micros();
        let mut removed = 0;

        for key in self.table.keys() {
            let Some(current) = self.table.get(&key) else {
                continue;
            };
            let mut record = match LockRecord::decode(&current) {
                Ok(record) => record,
                Err(error) => {
                    self.discard(&key, &current, &error);
                    continue;
                }
            };

            let expired = record.sweep_expired(now);
            if expired == 0 {
                continue;
            }

            let replacement = match self.encode_replacement(&key, &record) {
                Ok(replacement) => replacement,
                Err(_) => continue,
            };
            // A lost swap means someone else rewrote the row meanwhile; their
            // own sweep already handled it.
            if let Ok(true) =
                self.table
                    .compare_and_swap(&key, Some(&current), replacement.as_deref())
            {
                removed += expired;
            }
        }

        self.stats
            .expired_swept
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(removed, "collected expired lock holders");
        }
        removed
    }

    /// Encode `record` for storage, or `None` when it is empty.
    fn encode_replacement(
        &self,
        resource: &str,
        record: &LockRecord,
    ) -> Result<Option<Vec<u8>>, LockError> {
        if record.is_empty() {
            return Ok(None);
        }
        record
            .encode(self.table.row_size())
            .map(Some)
            .map_err(|e| record_error(resource, e))
    }

    /// Report a damaged row and delete it if it has not changed since it was
    /// read.
    fn discard(&self, resource: &str, bytes: &[u8], error: &RecordError) {
        self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
        report_damaged(self.report_level, resource, error);
        // A failed swap means a newer write already replaced the damaged row.
        let _ = self.table.compare_and_swap(resource, Some(bytes), None);
    }
}

#[async_trait]
impl Backend for SharedTableBackend {
    fn name(&self) -> &'static str {
        "table"
    }

    fn wait_step(&self) -> Duration {
        self.wait_step
    }

    fn try_acquire(
        &self,
        owner: OwnerId,
        resource: &str,
        level: LockLevel,
        hold: Duration,
    ) -> Result<Attempt, LockError> {
        validate_resource(resource)?;

        let current = self.table.get(resource);
        let mut record = match current.as_deref() {
            None => LockRecord::default(),
            Some(bytes) => match LockRecord::decode(bytes) {
                Ok(record) => record,
                Err(error) => {
                    self.discard(resource, bytes, &error);
                    return Err(LockError::corrupted(resource, level));
                }
            },
        };

        let now = clock::now_micros();
        let swept = record.sweep(now, owner);
        if swept.expired > 0 {
            self.stats
                .expired_swept
                .fetch_add(swept.expired as u64, Ordering::Relaxed);
            tracing::debug!(resource, expired = swept.expired, "swept expired holders");
        }

        if !record.admits(level) {
            self.stats.contended.fetch_add(1, Ordering::Relaxed);
            return Ok(Attempt::Contended);
        }

        let holder = Holder::new(owner, level, now, clock::duration_micros(hold));
        record.push(holder);
        let bytes = record
            .encode(self.table.row_size())
            .map_err(|e| record_error(resource, e))?;

        let swapped = self
            .table
            .compare_and_swap(resource, current.as_deref(), Some(&bytes))
            .map_err(|e| table_error(resource, e))?;
        if !swapped || !self.verify(resource, &bytes, &holder) {
            self.stats.lost_races.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(resource, %owner, %level, "lost optimistic write race");
            return Ok(Attempt::Contended);
        }

        self.stats.granted.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Granted)
    }

    fn release_lock(&self, owner: OwnerId, resource: &str) -> Result<(), LockError> {
        loop {
            let Some(current) = self.table.get(resource) else {
                return Ok(());
            };

            let mut record = match LockRecord::decode(&current) {
                Ok(record) => record,
                Err(error) => {
                    self.discard(resource, &current, &error);
                    return Ok(());
                }
            };

            if !record.remove_owner(owner) {
                return Ok(());
            }

            let replacement = self.encode_replacement(resource, &record)?;
            let swapped = self
                .table
                .compare_and_swap(resource, Some(&current), replacement.as_deref())
                .map_err(|e| table_error(resource, e))?;
            if swapped {
                self.stats.released.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }
}

impl SharedTableBackend {
    /// Read the row back after a successful write and check the caller still
    /// holds its entry.
    fn verify(&self, resource: &str, written: &[u8], holder: &Holder) -> bool {
        match self.table.get(resource) {
            Some(stored) if stored == written => true,
            Some(stored) => LockRecord::decode(&stored)
                .map(|record| record.holders().contains(holder))
                .unwrap_or(false),
            None => false,
        }
    }
}

fn record_error(resource: &str, error: RecordError) -> LockError {
    match error {
        RecordError::TooLarge { size, limit } => LockError::CapacityExceeded {
            resource: resource.to_string(),
            size,
            limit,
        },
        other => LockError::InvalidArgument(format!("cannot encode lock record: {}", other)),
    }
}

fn table_error(resource: &str, error: TableError) -> LockError {
    match error {
        TableError::Full { capacity } => LockError::ResourceExhausted { capacity },
        TableError::RowTooLarge { size, limit } => LockError::CapacityExceeded {
            resource: resource.to_string(),
            size,
            limit,
        },
    }
}

/// Emit one event for a damaged row at the configured severity.
fn report_damaged(level: Level, resource: &str, error: &RecordError) {
    let message = match error {
        RecordError::Damaged(_) => "discarding damaged lock record",
        _ => "discarding structurally invalid lock record",
    };
    match level {
        Level::ERROR => tracing::error!(resource, %error, "{}", message),
        Level::WARN => tracing::warn!(resource, %error, "{}", message),
        Level::INFO => tracing::info!(resource, %error, "{}", message),
        Level::DEBUG => tracing::debug!(resource, %error, "{}", message),
        _ => tracing::trace!(resource, %error, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(60);

    fn backend() -> SharedTableBackend {
        SharedTableBackend::new(8, 1024)
    }

    #[test]
    fn wait_step_has_a_floor() {
        let backend = backend().with_wait_step(Duration::ZERO);
        assert_eq!(backend.wait_step(), Duration::from_micros(MIN_WAIT_STEP_US));

        let backend = backend.with_wait_step(Duration::from_millis(5));
        assert_eq!(backend.wait_step(), Duration::from_millis(5));
    }

    #[test]
    fn acquire_then_release_leaves_no_record() {
        let backend = backend();
        let owner = OwnerId::next();

        let attempt = backend
            .try_acquire(owner, "orders", LockLevel::Exclusive, HOLD)
            .unwrap();
        assert_eq!(attempt, Attempt::Granted);
        assert!(backend.table().contains_key("orders"));

        backend.release_lock(owner, "orders").unwrap();
        assert!(!backend.table().contains_key("orders"));
        assert_eq!(backend.stats().released, 1);
    }

    #[test]
    fn compatible_holders_share_a_record() {
        let backend = backend();
        let (a, b) = (OwnerId::next(), OwnerId::next());

        assert_eq!(
            backend.try_acquire(a, "r", LockLevel::READ, HOLD).unwrap(),
            Attempt::Granted
        );
        assert_eq!(
            backend.try_acquire(b, "r", LockLevel::READ, HOLD).unwrap(),
            Attempt::Granted
        );

        let record = backend.record("r").unwrap().unwrap();
        assert_eq!(record.len(), 2);

        backend.release_lock(a, "r").unwrap();
        let record = backend.record("r").unwrap().unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.holders()[0].owner, b);
    }

    #[test]
    fn incompatible_request_is_contended_and_writes_nothing() {
        let backend = backend();
        let (a, b) = (OwnerId::next(), OwnerId::next());

        backend.try_acquire(a, "r", LockLevel::WRITE, HOLD).unwrap();
        let before = backend.table().get("r");

        assert_eq!(
            backend.try_acquire(b, "r", LockLevel::WRITE, HOLD).unwrap(),
            Attempt::Contended
        );
        assert_eq!(backend.table().get("r"), before);
        assert_eq!(backend.stats().contended, 1);
    }

    #[test]
    fn own_holder_never_blocks_reacquire() {
        let backend = backend();
        let owner = OwnerId::next();

        backend.try_acquire(owner, "r", LockLevel::Exclusive, HOLD).unwrap();
        assert_eq!(
            backend.try_acquire(owner, "r", LockLevel::Exclusive, HOLD).unwrap(),
            Attempt::Granted
        );
        // Replaced, not duplicated.
        assert_eq!(backend.record("r").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn expired_holder_is_swept() {
        let backend = backend();
        let (a, b) = (OwnerId::next(), OwnerId::next());

        backend
            .try_acquire(a, "r", LockLevel::Exclusive, Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(
            backend.try_acquire(b, "r", LockLevel::Exclusive, HOLD).unwrap(),
            Attempt::Granted
        );
        let record = backend.record("r").unwrap().unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.holders()[0].owner, b);
        assert_eq!(backend.stats().expired_swept, 1);
    }

    #[test]
    fn release_only_removes_own_holder() {
        let backend = backend();
        let (a, b) = (OwnerId::next(), OwnerId::next());

        backend.try_acquire(a, "r", LockLevel::READ, HOLD).unwrap();
        backend.release_lock(b, "r").unwrap();
        assert_eq!(backend.record("r").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn release_twice_is_noop() {
        let backend = backend();
        let owner = OwnerId::next();

        backend.try_acquire(owner, "r", LockLevel::READ, HOLD).unwrap();
        backend.release_lock(owner, "r").unwrap();
        backend.release_lock(owner, "r").unwrap();
        assert!(backend.table().is_empty());
    }

    #[test]
    fn corrupted_record_fails_attempt_and_is_deleted() {
        let backend = backend();
        backend.table().set("r", b"\x01\x02not a record").unwrap();

        let err = backend
            .try_acquire(OwnerId::next(), "r", LockLevel::READ, HOLD)
            .unwrap_err();
        assert_eq!(err, LockError::corrupted("r", LockLevel::READ));
        assert!(!backend.table().contains_key("r"));
        assert_eq!(backend.stats().corrupted, 1);
    }

    #[test]
    fn invalid_level_in_record_is_treated_as_corruption() {
        let backend = backend();
        backend.table().set("r", b"[[1,2,3,4,5]]").unwrap();

        let err = backend
            .try_acquire(OwnerId::next(), "r", LockLevel::READ, HOLD)
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!backend.table().contains_key("r"));
    }

    #[test]
    fn corrupted_record_on_release_is_deleted() {
        let backend = backend();
        backend.table().set("r", b"{").unwrap();

        backend.release_lock(OwnerId::next(), "r").unwrap();
        assert!(!backend.table().contains_key("r"));
    }

    #[test]
    fn full_table_is_resource_exhausted() {
        let backend = SharedTableBackend::new(1, 1024);
        let owner = OwnerId::next();
        backend.try_acquire(owner, "a", LockLevel::READ, HOLD).unwrap();
        let before = backend.table().get("a");

        let err = backend
            .try_acquire(owner, "b", LockLevel::READ, HOLD)
            .unwrap_err();
        assert_eq!(err, LockError::ResourceExhausted { capacity: 1 });
        assert_eq!(backend.table().get("a"), before);
        assert!(!backend.table().contains_key("b"));
    }

    #[test]
    fn oversized_record_is_capacity_exceeded() {
        let backend = SharedTableBackend::new(4, 64);
        backend
            .try_acquire(OwnerId::new(1, 1), "r", LockLevel::ConcurrentRead, HOLD)
            .unwrap();

        let err = backend
            .try_acquire(OwnerId::new(1, 2), "r", LockLevel::ConcurrentRead, HOLD)
            .unwrap_err();
        assert!(matches!(err, LockError::CapacityExceeded { limit: 64, .. }));
        assert_eq!(backend.record("r").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn empty_resource_rejected() {
        let err = backend()
            .try_acquire(OwnerId::next(), "", LockLevel::READ, HOLD)
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
    }

    #[test]
    fn collect_expired_deletes_dead_records() {
        let backend = backend();
        let (a, b) = (OwnerId::next(), OwnerId::next());
        backend.try_acquire(a, "dead", LockLevel::READ, Duration::ZERO).unwrap();
        backend.try_acquire(b, "live", LockLevel::READ, HOLD).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(backend.collect_expired(), 1);
        assert!(!backend.table().contains_key("dead"));
        assert!(backend.table().contains_key("live"));
    }

    #[test]
    fn verify_accepts_record_extended_by_later_writer() {
        let backend = backend();
        let (a, b) = (OwnerId::new(9, 1), OwnerId::new(9, 2));
        let mine = Holder::new(a, LockLevel::READ, clock::now_micros(), 60_000_000);
        let written = LockRecord::new(vec![mine]).encode(1024).unwrap();

        let theirs = Holder::new(b, LockLevel::READ, clock::now_micros(), 60_000_000);
        let extended = LockRecord::new(vec![mine, theirs]).encode(1024).unwrap();
        backend.table().set("r", &extended).unwrap();

        assert!(backend.verify("r", &written, &mine));
        backend.table().delete("r");
        assert!(!backend.verify("r", &written, &mine));
    }

    #[test]
    fn from_config_applies_settings() {
        let config = LockConfig {
            table_capacity: 3,
            max_record_bytes: 128,
            wait_step_us: 5000,
            corruption_log_level: "warn".to_string(),
            ..Default::default()
        };
        let backend = SharedTableBackend::from_config(&config).unwrap();
        assert_eq!(backend.table().capacity(), 3);
        assert_eq!(backend.table().row_size(), 128);
        assert_eq!(backend.wait_step(), Duration::from_millis(5));
        assert_eq!(backend.report_level, Level::WARN);
    }
}
