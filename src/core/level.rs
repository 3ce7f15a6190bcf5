//! core::level
//!
//! The six lock levels and their compatibility matrix.
//!
//! # Levels
//!
//! Levels are ordered by increasing exclusivity. The numeric values are the
//! ones stored in the shared lock table, so they are part of the record
//! format and must not change.
//!
//! | Level            | Value | Abbrev |
//! |------------------|-------|--------|
//! | Null             | 1     | NL     |
//! | ConcurrentRead   | 2     | CR     |
//! | ConcurrentWrite  | 4     | CW     |
//! | ProtectedRead    | 8     | PR     |
//! | ProtectedWrite   | 16    | PW     |
//! | Exclusive        | 32    | EX     |
//!
//! `READ` is an alias for `ProtectedRead` and `WRITE` for `ProtectedWrite`.
//!
//! # Compatibility
//!
//! ```text
//! held\req  NL CR CW PR PW EX
//! NL         Y  Y  Y  Y  Y  Y
//! CR         Y  Y  Y  Y  Y  N
//! CW         Y  Y  Y  N  N  N
//! PR         Y  Y  N  Y  N  N
//! PW         Y  Y  N  N  N  N
//! EX         Y  N  N  N  N  N
//! ```
//!
//! # Invariants
//!
//! - Only NL, CR, CW and PR are self-compatible
//! - EX is compatible only with NL
//!
//! # Example
//!
//! ```
//! use stacklock::core::level::{compatible, LockLevel};
//!
//! assert!(compatible(LockLevel::READ, LockLevel::READ));
//! assert!(!compatible(LockLevel::WRITE, LockLevel::WRITE));
//! assert!(LockLevel::Exclusive > LockLevel::ProtectedWrite);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::LockError;

/// An advisory lock level, ordered from least to most exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum LockLevel {
    /// Null: expresses interest only, blocks nothing.
    Null = 1,
    /// Concurrent read: unprotected read access.
    ConcurrentRead = 2,
    /// Concurrent write: unprotected write access.
    ConcurrentWrite = 4,
    /// Protected read: the traditional shared lock.
    ProtectedRead = 8,
    /// Protected write: the traditional update lock.
    ProtectedWrite = 16,
    /// Exclusive: the traditional exclusive lock.
    Exclusive = 32,
}

impl LockLevel {
    /// Alias for [`LockLevel::ProtectedRead`].
    pub const READ: LockLevel = LockLevel::ProtectedRead;

    /// Alias for [`LockLevel::ProtectedWrite`].
    pub const WRITE: LockLevel = LockLevel::ProtectedWrite;

    /// Every level, least exclusive first.
    pub const ALL: [LockLevel; 6] = [
        LockLevel::Null,
        LockLevel::ConcurrentRead,
        LockLevel::ConcurrentWrite,
        LockLevel::ProtectedRead,
        LockLevel::ProtectedWrite,
        LockLevel::Exclusive,
    ];

    /// The stored numeric value of this level.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Convert a stored numeric value back into a level.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if `bits` is not one of the six
    /// defined values.
    pub fn from_bits(bits: u8) -> Result<Self, LockError> {
        match bits {
            1 => Ok(LockLevel::Null),
            2 => Ok(LockLevel::ConcurrentRead),
            4 => Ok(LockLevel::ConcurrentWrite),
            8 => Ok(LockLevel::ProtectedRead),
            16 => Ok(LockLevel::ProtectedWrite),
            32 => Ok(LockLevel::Exclusive),
            other => Err(LockError::InvalidArgument(format!(
                "{} is not a valid lock level (valid: 1, 2, 4, 8, 16, 32)",
                other
            ))),
        }
    }

    /// Check whether `bits` is one of the six defined level values.
    pub fn is_valid_level(bits: u8) -> bool {
        Self::from_bits(bits).is_ok()
    }

    /// The DLM abbreviation (`NL`, `CR`, `CW`, `PR`, `PW`, `EX`).
    pub fn abbreviation(self) -> &'static str {
        match self {
            LockLevel::Null => "NL",
            LockLevel::ConcurrentRead => "CR",
            LockLevel::ConcurrentWrite => "CW",
            LockLevel::ProtectedRead => "PR",
            LockLevel::ProtectedWrite => "PW",
            LockLevel::Exclusive => "EX",
        }
    }

    /// Whether a holder at `self` admits a new holder at `requested`.
    pub fn is_compatible_with(self, requested: LockLevel) -> bool {
        use LockLevel::*;

        match self {
            Null => true,
            ConcurrentRead => requested != Exclusive,
            ConcurrentWrite => matches!(requested, Null | ConcurrentRead | ConcurrentWrite),
            ProtectedRead => matches!(requested, Null | ConcurrentRead | ProtectedRead),
            ProtectedWrite => matches!(requested, Null | ConcurrentRead),
            Exclusive => requested == Null,
        }
    }

    /// Whether two holders at this level may coexist.
    pub fn is_self_compatible(self) -> bool {
        self.is_compatible_with(self)
    }

    /// The more exclusive of the two levels.
    pub fn escalate(self, other: LockLevel) -> LockLevel {
        self.max(other)
    }
}

/// Look up the compatibility matrix entry for (`held`, `requested`).
pub fn compatible(held: LockLevel, requested: LockLevel) -> bool {
    held.is_compatible_with(requested)
}

/// Look up the compatibility matrix using raw stored values.
///
/// # Errors
///
/// Returns [`LockError::InvalidArgument`] if either value is not a defined
/// level.
pub fn compatible_bits(held: u8, requested: u8) -> Result<bool, LockError> {
    Ok(compatible(
        LockLevel::from_bits(held)?,
        LockLevel::from_bits(requested)?,
    ))
}

impl TryFrom<u8> for LockLevel {
    type Error = LockError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        LockLevel::from_bits(bits)
    }
}

impl From<LockLevel> for u8 {
    fn from(level: LockLevel) -> Self {
        level.bits()
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}

impl FromStr for LockLevel {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        match normalized.as_str() {
            "nl" | "null" => Ok(LockLevel::Null),
            "cr" | "concurrentread" => Ok(LockLevel::ConcurrentRead),
            "cw" | "concurrentwrite" => Ok(LockLevel::ConcurrentWrite),
            "pr" | "protectedread" | "read" => Ok(LockLevel::ProtectedRead),
            "pw" | "protectedwrite" | "write" => Ok(LockLevel::ProtectedWrite),
            "ex" | "exclusive" => Ok(LockLevel::Exclusive),
            _ => Err(LockError::InvalidArgument(format!(
                "unknown lock level '{}' (valid: NL, CR, CW, PR, PW, EX, read, write)",
                s
            ))),
        }
    }
}
