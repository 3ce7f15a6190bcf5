//! backend::record
//!
//! Lock records: the unit of shared state stored per resource.
//!
//! # Format
//!
//! A record is an ordered list of holders. On the wire each holder is the
//! tuple `(process_id, unit_id, level, obtained_at_us, hold_us)` and the
//! record is the JSON array of those tuples:
//!
//! ```text
//! [[4242,7,8,1700000000000000,120000000],[4242,9,2,1700000000500000,1000000]]
//! ```
//!
//! The encoded form must fit in one table row (`max_record_bytes`), which
//! bounds the number of holders per resource.
//!
//! # Invariants
//!
//! - A holder is live iff `obtained_at_us + hold_us >= now`
//! - An empty record is never stored; it is deleted instead
//! - Decoding distinguishes damaged bytes from well-formed but invalid values

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::level::LockLevel;
use crate::core::owner::OwnerId;

/// Errors from encoding or decoding a lock record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The stored bytes are not a record at all (partial or torn write).
    #[error("damaged lock record: {0}")]
    Damaged(String),

    /// The stored bytes parse but hold an impossible value.
    #[error("invalid lock record: {0}")]
    Invalid(String),

    /// The encoded record does not fit in a table row.
    #[error("encoded lock record is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Encoded size in bytes
        size: usize,
        /// Row limit in bytes
        limit: usize,
    },
}

/// One execution unit's claim on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    /// Who holds the claim.
    pub owner: OwnerId,
    /// At which level.
    pub level: LockLevel,
    /// When the claim was written, in microseconds since the epoch.
    pub obtained_at_us: u64,
    /// Lease length in microseconds.
    pub hold_us: u64,
}

impl Holder {
    /// Create a holder entry.
    pub fn new(owner: OwnerId, level: LockLevel, obtained_at_us: u64, hold_us: u64) -> Self {
        Self {
            owner,
            level,
            obtained_at_us,
            hold_us,
        }
    }

    /// When the lease runs out, in microseconds since the epoch.
    pub fn expires_at_us(&self) -> u64 {
        self.obtained_at_us.saturating_add(self.hold_us)
    }

    /// Check if the lease is still running at `now_us`.
    pub fn is_live(&self, now_us: u64) -> bool {
        self.expires_at_us() >= now_us
    }
}

/// Wire form of a holder.
#[derive(Debug, Serialize, Deserialize)]
struct HolderRow(u32, u64, u8, u64, u64);

impl From<&Holder> for HolderRow {
    fn from(h: &Holder) -> Self {
        HolderRow(
            h.owner.process_id,
            h.owner.unit_id,
            h.level.bits(),
            h.obtained_at_us,
            h.hold_us,
        )
    }
}

impl TryFrom<HolderRow> for Holder {
    type Error = RecordError;

    fn try_from(row: HolderRow) -> Result<Self, Self::Error> {
        let HolderRow(process_id, unit_id, level, obtained_at_us, hold_us) = row;
        let level = LockLevel::from_bits(level).map_err(|e| RecordError::Invalid(e.to_string()))?;
        Ok(Holder::new(
            OwnerId::new(process_id, unit_id),
            level,
            obtained_at_us,
            hold_us,
        ))
    }
}

/// The ordered holders of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRecord {
    holders: Vec<Holder>,
}

/// What a sweep removed from a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Holders dropped because their lease ran out.
    pub expired: usize,
    /// Holders dropped because they belong to the sweeping owner.
    pub own: usize,
}

impl LockRecord {
    /// Create a record from holders.
    pub fn new(holders: Vec<Holder>) -> Self {
        Self { holders }
    }

    /// The holders in insertion order.
    pub fn holders(&self) -> &[Holder] {
        &self.holders
    }

    /// Check if the record has no holders.
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// Number of holders.
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Find the holder entry of `owner`.
    pub fn holder_of(&self, owner: OwnerId) -> Option<&Holder> {
        self.holders.iter().find(|h| h.owner == owner)
    }

    /// Drop expired holders and every holder belonging to `owner`.
    ///
    /// Removing the caller's own entry keeps a reacquire from blocking on
    /// itself.
    pub fn sweep(&mut self, now_us: u64, owner: OwnerId) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        self.holders.retain(|h| {
            if h.owner == owner {
                outcome.own += 1;
                false
            } else if !h.is_live(now_us) {
                outcome.expired += 1;
                false
            } else {
                true
            }
        });
        outcome
    }

    /// Drop expired holders only. Returns how many were removed.
    pub fn sweep_expired(&mut self, now_us: u64) -> usize {
        let before = self.holders.len();
        self.holders.retain(|h| h.is_live(now_us));
        before - self.holders.len()
    }

    /// Check if every remaining holder admits a new holder at `requested`.
    pub fn admits(&self, requested: LockLevel) -> bool {
        self.holders
            .iter()
            .all(|h| h.level.is_compatible_with(requested))
    }

    /// Append a holder.
    pub fn push(&mut self, holder: Holder) {
        self.holders.push(holder);
    }

    /// Remove every holder belonging to `owner`. Returns whether any was removed.
    pub fn remove_owner(&mut self, owner: OwnerId) -> bool {
        let before = self.holders.len();
        self.holders.retain(|h| h.owner != owner);
        before != self.holders.len()
    }

    /// Encode the record, enforcing the row limit.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::TooLarge`] if the encoding exceeds `limit` bytes.
    pub fn encode(&self, limit: usize) -> Result<Vec<u8>, RecordError> {
        let rows: Vec<HolderRow> = self.holders.iter().map(HolderRow::from).collect();
        let bytes = serde_json::to_vec(&rows).map_err(|e| RecordError::Invalid(e.to_string()))?;
        if bytes.len() > limit {
            return Err(RecordError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }
        Ok(bytes)
    }

    /// Decode a stored record.
    ///
    /// # Errors
    ///
    /// - [`RecordError::Damaged`] if the bytes are not a holder list
    /// - [`RecordError::Invalid`] if a holder carries an undefined level or
    ///   the record is stored empty
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let rows: Vec<HolderRow> =
            serde_json::from_slice(bytes).map_err(|e| RecordError::Damaged(e.to_string()))?;
        if rows.is_empty() {
            return Err(RecordError::Invalid(
                "empty record stored in table".to_string(),
            ));
        }
        let holders = rows
            .into_iter()
            .map(Holder::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { holders })
    }
}
