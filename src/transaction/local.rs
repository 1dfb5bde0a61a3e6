//! Local Transaction Seam
//!
//! The producer-side business transaction that decides whether a half
//! message becomes visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::state::TransactionState;
use super::types::TransferEvent;

/// Local business transaction bound to a transactional publish
///
/// # Contract
/// - `execute` performs the side effect and reports the decision. An `Err`
///   (or a panic) means the outcome is not known; the coordinator reports
///   UNKNOWN and leaves the decision to check-back. It is never read as a
///   rollback.
/// - `check` only inspects the system of record. It is called out of band,
///   possibly many times and arbitrarily late, and must never perform the
///   business effect.
#[async_trait]
pub trait LocalTransaction: Send + Sync {
    /// Run the local transaction for `event`
    async fn execute(&self, event: &TransferEvent) -> anyhow::Result<TransactionState>;

    /// Re-derive the historical outcome for `event`
    ///
    /// `born_at` is when the broker accepted the half message, which lets an
    /// implementation tell "still running" apart from "never committed".
    async fn check(
        &self,
        event: &TransferEvent,
        born_at: DateTime<Utc>,
    ) -> anyhow::Result<TransactionState>;
}
