//! Transaction Coordinator
//!
//! Drives the publish side of the outbox:
//! prepare (half message) → execute local transaction → decide → end.
//! Also answers the broker's status checks for halves whose decision was lost.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::PublishError;
use super::local::LocalTransaction;
use super::state::TransactionState;
use super::types::{DeliveryOutcome, TransferEvent};
use crate::broker::Transport;
use crate::config::BrokerConfig;
use crate::dispatch::panic_message;
use crate::messages::{HalfMessage, OutboundMessage, PROPERTY_ORDER_ID, PublishMode};

/// Transaction Coordinator - owns the prepare / execute / decide protocol
pub struct TransactionCoordinator {
    transport: Arc<dyn Transport>,
    local: Arc<dyn LocalTransaction>,
    topic: String,
    tag: String,
}

impl TransactionCoordinator {
    /// Create a coordinator publishing to `topic` / `tag`
    pub fn new(
        transport: Arc<dyn Transport>,
        local: Arc<dyn LocalTransaction>,
        topic: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            local,
            topic: topic.into(),
            tag: tag.into(),
        }
    }

    /// Create a coordinator using the topic and tag from configuration
    pub fn from_config(
        transport: Arc<dyn Transport>,
        local: Arc<dyn LocalTransaction>,
        config: &BrokerConfig,
    ) -> Self {
        Self::new(transport, local, &config.topic, &config.tag)
    }

    /// Publish `event` bound to the local transaction
    ///
    /// 1. Send the serialized event as a half message (keys = record number,
    ///    `orderId` property = `order_key` when given)
    /// 2. On prepare acknowledgement, run the local transaction
    /// 3. Attach the decision to the half message
    ///
    /// # Errors
    /// Only a rejected prepare fails the call; it is not retried here.
    /// A failed `end_transaction` is reported as UNKNOWN because the broker
    /// still holds the half message and will check back.
    pub async fn publish_transactional(
        &self,
        event: &TransferEvent,
        order_key: Option<&str>,
    ) -> Result<DeliveryOutcome, PublishError> {
        let body = event.encode()?;
        let mut message = OutboundMessage::new(&self.topic, &self.tag, event.record_no(), body);
        if let Some(key) = order_key {
            message = message.with_property(PROPERTY_ORDER_ID, key);
        }

        let receipt = self
            .transport
            .send(message, PublishMode::Prepare)
            .await
            .inspect_err(|e| {
                warn!(
                    record_no = %event.record_no(),
                    transport = self.transport.name(),
                    code = e.code(),
                    error = %e,
                    "Prepare rejected"
                );
            })?;

        debug!(
            record_no = %event.record_no(),
            msg_id = %receipt.msg_id,
            "Half message accepted"
        );

        let decided = self.execute_local(event).await;

        let state = match self.transport.end_transaction(&receipt, decided).await {
            Ok(()) => decided,
            Err(e) => {
                warn!(
                    msg_id = %receipt.msg_id,
                    decided = %decided,
                    error = %e,
                    "End transaction failed, outcome left to check-back"
                );
                TransactionState::Unknown
            }
        };

        info!(
            record_no = %event.record_no(),
            transaction_id = %event.transaction_id(),
            msg_id = %receipt.msg_id,
            state = %state,
            "Transactional publish finished"
        );

        Ok(DeliveryOutcome { receipt, state })
    }

    /// Answer a broker status check for an unresolved half message
    ///
    /// Idempotent and read-only: re-derives the outcome from the system of
    /// record. Any doubt is answered with UNKNOWN so the broker asks again.
    pub async fn check_transaction_status(&self, half: &HalfMessage) -> TransactionState {
        let event = match TransferEvent::decode(&half.message.body) {
            Ok(event) => event,
            Err(e) => {
                // Never produced by this coordinator, so it can never commit
                error!(
                    msg_id = %half.msg_id,
                    error = %e,
                    "Undecodable half message, rolling back"
                );
                return TransactionState::Rollback;
            }
        };

        let checked = AssertUnwindSafe(self.local.check(&event, half.born_at))
            .catch_unwind()
            .await;

        let state = match checked {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                warn!(
                    msg_id = %half.msg_id,
                    transaction_id = %event.transaction_id(),
                    error = %e,
                    "Status check failed"
                );
                TransactionState::Unknown
            }
            Err(payload) => {
                error!(
                    msg_id = %half.msg_id,
                    transaction_id = %event.transaction_id(),
                    panic = %panic_message(payload.as_ref()),
                    "Status check panicked"
                );
                TransactionState::Unknown
            }
        };

        debug!(
            msg_id = %half.msg_id,
            transaction_id = %event.transaction_id(),
            check_times = half.check_times,
            state = %state,
            "Status check answered"
        );

        state
    }

    /// Run the local transaction; errors and panics become UNKNOWN
    async fn execute_local(&self, event: &TransferEvent) -> TransactionState {
        match AssertUnwindSafe(self.local.execute(event))
            .catch_unwind()
            .await
        {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                warn!(
                    transaction_id = %event.transaction_id(),
                    error = %e,
                    "Local transaction failed, outcome UNKNOWN"
                );
                TransactionState::Unknown
            }
            Err(payload) => {
                error!(
                    transaction_id = %event.transaction_id(),
                    panic = %panic_message(payload.as_ref()),
                    "Local transaction panicked, outcome UNKNOWN"
                );
                TransactionState::Unknown
            }
        }
    }
}
