//! Transaction State Definitions
//!
//! The decision attached to a half message. State IDs are stable so a
//! persistent broker or journal can store them as a small integer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a transactional publish
///
/// ```text
/// UNKNOWN ──▶ COMMIT
///    │
///    └──────▶ ROLLBACK
/// ```
///
/// Decided once, either by the local execution path or by a later
/// status check. COMMIT and ROLLBACK are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i8)]
pub enum TransactionState {
    /// Outcome not known yet - resolved later through check-back
    Unknown = 0,

    /// Terminal: the local transaction committed, message becomes visible
    Commit = 1,

    /// Terminal: the local transaction did not commit, message is discarded
    Rollback = -1,
}

impl TransactionState {
    /// Check if a decision has been reached
    #[inline]
    pub fn is_decided(&self) -> bool {
        !matches!(self, TransactionState::Unknown)
    }

    /// Whether a half message in this state may be moved to `next`
    ///
    /// Undecided halves accept anything. Decided halves only accept the
    /// same decision again, so repeated check-back answers are harmless.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        match self {
            TransactionState::Unknown => true,
            decided => *decided == next,
        }
    }

    /// Get the numeric state ID for storage
    #[inline]
    pub fn id(&self) -> i8 {
        *self as i8
    }

    /// Convert from a stored state ID
    pub fn from_id(id: i8) -> Option<Self> {
        match id {
            0 => Some(TransactionState::Unknown),
            1 => Some(TransactionState::Commit),
            -1 => Some(TransactionState::Rollback),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Unknown => "UNKNOWN",
            TransactionState::Commit => "COMMIT",
            TransactionState::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i8> for TransactionState {
    type Error = ();

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        TransactionState::from_id(value).ok_or(())
    }
}
