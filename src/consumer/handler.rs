//! Idempotent Message Handler
//!
//! Applies one delivered transfer event at most once per record number.
//!
//! ```text
//! decode ─▶ validate ─▶ load target ─▶ claim ─▶ apply ─▶ mark applied
//!   │          │            │            │         │
//!   REJECTED   REJECTED     REJECTED/    ALREADY_  REJECTED / RETRY
//!                           RETRY        APPLIED/  (claim released)
//!                                        RETRY
//! ```

use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::idempotency::{ClaimOutcome, IdempotencyStore};
use crate::dispatch::panic_message;
use crate::ledger::{AccountStore, StoreError};
use crate::messages::DeliveredMessage;
use crate::transaction::TransferEvent;

/// Why a message can never be applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Missing record number")]
    MissingRecordNo,

    #[error("Amount must be positive")]
    NonPositiveAmount,

    #[error("Target account not found: {0}")]
    TargetNotFound(u64),
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Malformed(_) => "MALFORMED_PAYLOAD",
            RejectReason::MissingRecordNo => "MISSING_RECORD_NO",
            RejectReason::NonPositiveAmount => "NON_POSITIVE_AMOUNT",
            RejectReason::TargetNotFound(_) => "TARGET_NOT_FOUND",
        }
    }
}

/// Result of handling one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Effect applied by this delivery
    Applied,
    /// Effect was applied by an earlier delivery
    AlreadyApplied,
    /// Can never be applied, send to dead letters
    Rejected(RejectReason),
    /// Transient failure, ask the broker to redeliver
    Retry,
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleOutcome::Applied => "APPLIED",
            HandleOutcome::AlreadyApplied => "ALREADY_APPLIED",
            HandleOutcome::Rejected(_) => "REJECTED",
            HandleOutcome::Retry => "RETRY",
        }
    }

    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, HandleOutcome::Retry)
    }
}

impl fmt::Display for HandleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handler between delivery and the business store
pub struct MessageHandler {
    accounts: Arc<dyn AccountStore>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl MessageHandler {
    pub fn new(accounts: Arc<dyn AccountStore>, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            accounts,
            idempotency,
        }
    }

    /// Handle one delivered message
    pub async fn handle(&self, message: &DeliveredMessage) -> HandleOutcome {
        let event = match TransferEvent::decode(&message.body) {
            Ok(event) => event,
            Err(e) => {
                let reason = RejectReason::Malformed(e.to_string());
                warn!(
                    msg_id = %message.msg_id,
                    code = reason.code(),
                    body = %message.body_lossy(),
                    "Rejected undecodable message"
                );
                return HandleOutcome::Rejected(reason);
            }
        };

        let outcome = self.apply(&event).await;

        match &outcome {
            HandleOutcome::Applied => info!(
                msg_id = %message.msg_id,
                record_no = %event.record_no(),
                to_account = event.to_account(),
                amount = event.amount(),
                "Transfer applied"
            ),
            HandleOutcome::AlreadyApplied => debug!(
                msg_id = %message.msg_id,
                record_no = %event.record_no(),
                "Duplicate delivery absorbed"
            ),
            HandleOutcome::Rejected(reason) => warn!(
                msg_id = %message.msg_id,
                record_no = %event.record_no(),
                to_account = event.to_account(),
                code = reason.code(),
                reason = %reason,
                "Transfer rejected"
            ),
            HandleOutcome::Retry => warn!(
                msg_id = %message.msg_id,
                record_no = %event.record_no(),
                to_account = event.to_account(),
                reconsume_times = message.reconsume_times,
                "Transfer deferred for redelivery"
            ),
        }

        outcome
    }

    async fn apply(&self, event: &TransferEvent) -> HandleOutcome {
        if event.record_no().is_empty() {
            return HandleOutcome::Rejected(RejectReason::MissingRecordNo);
        }
        if event.amount() == 0 {
            return HandleOutcome::Rejected(RejectReason::NonPositiveAmount);
        }

        let target = event.to_account();
        match self.accounts.load(target).await {
            Ok(Some(_)) => {}
            Ok(None) => return HandleOutcome::Rejected(RejectReason::TargetNotFound(target)),
            Err(e) => {
                debug!(record_no = %event.record_no(), code = e.code(), "Target lookup failed");
                return HandleOutcome::Retry;
            }
        }

        match self.idempotency.try_claim(event.record_no()).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyApplied) => return HandleOutcome::AlreadyApplied,
            Ok(ClaimOutcome::InFlight) => return HandleOutcome::Retry,
            Err(e) => {
                debug!(record_no = %event.record_no(), code = e.code(), "Claim failed");
                return HandleOutcome::Retry;
            }
        }

        let applied = AssertUnwindSafe(self.accounts.apply_effect(target, event.amount()))
            .catch_unwind()
            .await;

        let outcome = match applied {
            Ok(Ok(rows)) if rows > 0 => {
                if let Err(e) = self.idempotency.mark_applied(event.record_no()).await {
                    // Effect is done; a redelivery may apply it again
                    error!(
                        record_no = %event.record_no(),
                        code = e.code(),
                        error = %e,
                        "Failed to mark record applied"
                    );
                }
                return HandleOutcome::Applied;
            }
            Ok(Ok(_)) | Ok(Err(StoreError::AccountNotFound(_))) => {
                HandleOutcome::Rejected(RejectReason::TargetNotFound(target))
            }
            Ok(Err(e)) => {
                debug!(record_no = %event.record_no(), code = e.code(), "Apply failed");
                HandleOutcome::Retry
            }
            Err(payload) => {
                error!(
                    record_no = %event.record_no(),
                    panic = %panic_message(payload.as_ref()),
                    "Apply panicked"
                );
                HandleOutcome::Retry
            }
        };

        if let Err(e) = self.idempotency.release(event.record_no()).await {
            error!(record_no = %event.record_no(), error = %e, "Failed to release claim");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::idempotency::InMemoryIdempotencyStore;
    use crate::ledger::{Account, Ledger};
    use crate::messages::OutboundMessage;
    use async_trait::async_trait;

    fn delivered(body: Vec<u8>) -> DeliveredMessage {
        DeliveredMessage::from_outbound("M-1", OutboundMessage::new("T", "*", "R-1", body))
    }

    fn transfer(record_no: &str, to: u64, amount: u64) -> DeliveredMessage {
        let event = TransferEvent::with_ids(record_no, "TX-1", 1, to, amount);
        delivered(event.encode().unwrap())
    }

    fn setup() -> (MessageHandler, Arc<Ledger>, Arc<InMemoryIdempotencyStore>) {
        let ledger = Arc::new(Ledger::new());
        ledger.open_account(2, 0).unwrap();
        let store = Arc::new(InMemoryIdempotencyStore::new());
        (MessageHandler::new(ledger.clone(), store.clone()), ledger, store)
    }

    #[tokio::test]
    async fn test_apply_then_duplicate() {
        let (handler, ledger, store) = setup();
        let message = transfer("R-1", 2, 100);

        assert_eq!(handler.handle(&message).await, HandleOutcome::Applied);
        assert_eq!(handler.handle(&message).await, HandleOutcome::AlreadyApplied);
        assert_eq!(ledger.balance(2).unwrap(), Some(100));
        assert_eq!(store.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (handler, _, store) = setup();

        let malformed = handler.handle(&delivered(b"{not json".to_vec())).await;
        assert!(matches!(
            malformed,
            HandleOutcome::Rejected(RejectReason::Malformed(_))
        ));
        assert_eq!(
            handler.handle(&transfer("R-2", 2, 0)).await,
            HandleOutcome::Rejected(RejectReason::NonPositiveAmount)
        );
        assert_eq!(
            handler.handle(&transfer("", 2, 10)).await,
            HandleOutcome::Rejected(RejectReason::MissingRecordNo)
        );
        assert_eq!(
            handler.handle(&transfer("R-3", 77, 10)).await,
            HandleOutcome::Rejected(RejectReason::TargetNotFound(77))
        );
        assert_eq!(store.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_retries_then_applies() {
        let (handler, ledger, store) = setup();
        let message = transfer("R-1", 2, 40);

        ledger.set_available(false);
        assert_eq!(handler.handle(&message).await, HandleOutcome::Retry);
        assert!(!store.is_applied("R-1").await.unwrap());

        ledger.set_available(true);
        assert_eq!(handler.handle(&message).await, HandleOutcome::Applied);
        assert_eq!(ledger.balance(2).unwrap(), Some(40));
    }

    /// Store whose apply fails or panics on demand
    struct FaultyAccounts {
        panic: bool,
        rows: u64,
    }

    #[async_trait]
    impl AccountStore for FaultyAccounts {
        async fn load(&self, account_id: u64) -> Result<Option<Account>, StoreError> {
            Ok(Some(Account {
                id: account_id,
                balance: 0,
            }))
        }

        async fn apply_effect(&self, _account_id: u64, _amount: u64) -> Result<u64, StoreError> {
            if self.panic {
                panic!("driver crashed");
            }
            Ok(self.rows)
        }
    }

    #[tokio::test]
    async fn test_apply_panic_releases_claim() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let handler = MessageHandler::new(
            Arc::new(FaultyAccounts {
                panic: true,
                rows: 1,
            }),
            store.clone(),
        );

        assert_eq!(handler.handle(&transfer("R-1", 2, 5)).await, HandleOutcome::Retry);
        assert_eq!(store.try_claim("R-1").await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_zero_rows_rejected_and_released() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let handler = MessageHandler::new(
            Arc::new(FaultyAccounts {
                panic: false,
                rows: 0,
            }),
            store.clone(),
        );

        assert_eq!(
            handler.handle(&transfer("R-1", 2, 5)).await,
            HandleOutcome::Rejected(RejectReason::TargetNotFound(2))
        );
        assert!(!store.is_applied("R-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_duplicate_retries() {
        let (handler, _, store) = setup();
        store.try_claim("R-1").await.unwrap();

        assert_eq!(handler.handle(&transfer("R-1", 2, 5)).await, HandleOutcome::Retry);
    }
}
