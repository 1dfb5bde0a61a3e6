//! Broker Boundary
//!
//! Capabilities consumed from the message transport, plus an in-process
//! broker used by tests and the demo binary.
//!
//! The transport is assumed at-least-once and partition-ordered, with a
//! half-message / commit-state protocol:
//! - `send(.., Prepare)` stores a hidden half message
//! - `end_transaction` attaches COMMIT / ROLLBACK / UNKNOWN to it
//! - unresolved halves are offered back to the producer through
//!   [`CheckBackSource`] at the broker's own cadence

pub mod in_memory;

pub use in_memory::{DeliveryStats, InMemoryBroker};

use async_trait::async_trait;

use crate::messages::{HalfMessage, OutboundMessage, PublishMode, SendReceipt};
use crate::transaction::{TransactionState, TransportError};

/// Publish side of the transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get transport name for logging
    fn name(&self) -> &'static str;

    /// Send a message, either directly visible or as a half message
    async fn send(
        &self,
        message: OutboundMessage,
        mode: PublishMode,
    ) -> Result<SendReceipt, TransportError>;

    /// Attach the decision to a half message
    ///
    /// `Unknown` leaves the half message pending check-back.
    async fn end_transaction(
        &self,
        receipt: &SendReceipt,
        state: TransactionState,
    ) -> Result<(), TransportError>;
}

/// Broker side of check-back: hands out unresolved half messages and
/// accepts the re-derived decision
#[async_trait]
pub trait CheckBackSource: Send + Sync {
    /// Up to `limit` half messages still UNKNOWN
    ///
    /// Each returned half counts as one check attempt.
    async fn unresolved(&self, limit: usize) -> Result<Vec<HalfMessage>, TransportError>;

    /// Record a decision reached by check-back
    async fn resolve(&self, msg_id: &str, state: TransactionState) -> Result<(), TransportError>;
}


#[cfg(test)]
pub use mock::MockTransport;
