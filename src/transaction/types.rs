//! Transaction Core Types
//!
//! The transfer event carried as payload, and the outcome of a
//! transactional publish.

use serde::{Deserialize, Serialize};

use super::error::CodecError;
use super::state::TransactionState;
use crate::messages::SendReceipt;

/// Business event published through the outbox
///
/// Created by the publisher before the local transaction runs and never
/// mutated afterwards, so fields are only reachable through getters.
/// Wire format is JSON with camelCase names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    /// Unique business record number, the idempotency key on the consumer side
    record_no: String,
    /// Debited account
    from_account: u64,
    /// Credited account
    to_account: u64,
    /// Amount in minor units
    amount: u64,
    /// Id of the producer's local transaction
    transaction_id: String,
}

impl TransferEvent {
    /// Create a new event with a fresh record number (UUIDv4) and
    /// transaction id (ULID)
    pub fn new(from_account: u64, to_account: u64, amount: u64) -> Self {
        Self {
            record_no: uuid::Uuid::new_v4().to_string(),
            from_account,
            to_account,
            amount,
            transaction_id: ulid::Ulid::new().to_string(),
        }
    }

    /// Create an event with caller-provided identifiers
    pub fn with_ids(
        record_no: impl Into<String>,
        transaction_id: impl Into<String>,
        from_account: u64,
        to_account: u64,
        amount: u64,
    ) -> Self {
        Self {
            record_no: record_no.into(),
            from_account,
            to_account,
            amount,
            transaction_id: transaction_id.into(),
        }
    }

    pub fn record_no(&self) -> &str {
        &self.record_no
    }

    pub fn from_account(&self) -> u64 {
        self.from_account
    }

    pub fn to_account(&self) -> u64 {
        self.to_account
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Serialize to the wire payload
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a wire payload
    ///
    /// Only the shape is checked here. Business rules (positive amount,
    /// existing target) belong to the consumer.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Result of `publish_transactional`
///
/// `state` is what the producer managed to attach to the half message.
/// `Unknown` is a legitimate outcome: the broker will check back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub receipt: SendReceipt,
    pub state: TransactionState,
}

impl DeliveryOutcome {
    /// Check if the message is already visible to consumers
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Commit
    }

    /// Check if the outcome awaits check-back
    #[inline]
    pub fn is_unresolved(&self) -> bool {
        !self.state.is_decided()
    }
}
