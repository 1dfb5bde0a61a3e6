//! Idempotency Store
//!
//! Remembers which record numbers were applied. A record moves
//! `absent → InFlight → Applied`, or back to absent when the apply failed.
//! Only `Applied` means the effect happened.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::ledger::StoreError;

/// Result of claiming a record number before applying it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller owns the record until `mark_applied` or `release`
    Claimed,
    /// Effect already applied, skip
    AlreadyApplied,
    /// Another delivery of the same record is being applied right now
    InFlight,
}

/// Record number → applied marker
///
/// # Contract
/// `try_claim` is atomic per record number: of two concurrent claims at most
/// one gets `Claimed`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn try_claim(&self, record_no: &str) -> Result<ClaimOutcome, StoreError>;

    /// Turn a claim into a permanent applied marker
    async fn mark_applied(&self, record_no: &str) -> Result<(), StoreError>;

    /// Drop a claim without applying; no effect on applied records
    async fn release(&self, record_no: &str) -> Result<(), StoreError>;

    async fn is_applied(&self, record_no: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    InFlight,
    Applied,
}

/// Volatile store; everything is forgotten on restart
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, RecordState>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of applied record numbers
    pub fn applied_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| *r.value() == RecordState::Applied)
            .count()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_claim(&self, record_no: &str) -> Result<ClaimOutcome, StoreError> {
        let outcome = match self.records.entry(record_no.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                RecordState::Applied => ClaimOutcome::AlreadyApplied,
                RecordState::InFlight => ClaimOutcome::InFlight,
            },
            Entry::Vacant(entry) => {
                entry.insert(RecordState::InFlight);
                ClaimOutcome::Claimed
            }
        };
        Ok(outcome)
    }

    async fn mark_applied(&self, record_no: &str) -> Result<(), StoreError> {
        self.records
            .insert(record_no.to_string(), RecordState::Applied);
        Ok(())
    }

    async fn release(&self, record_no: &str) -> Result<(), StoreError> {
        self.records
            .remove_if(record_no, |_, state| *state == RecordState::InFlight);
        Ok(())
    }

    async fn is_applied(&self, record_no: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .get(record_no)
            .is_some_and(|r| *r.value() == RecordState::Applied))
    }
}
