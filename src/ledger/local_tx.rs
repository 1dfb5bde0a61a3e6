//! Transfer as a local transaction
//!
//! Binds a transfer publish to the debit of the source account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{StoreError, TransferJournal};
use crate::config::CoordinatorConfig;
use crate::transaction::{LocalTransaction, TransactionState, TransferEvent};

/// Debit-and-journal local transaction
///
/// # Decisions
/// - debit journaled → COMMIT
/// - source missing or short on funds → ROLLBACK (nothing was written)
/// - store unavailable → error, which the coordinator reports as UNKNOWN
///
/// # Check-back
/// A journaled transfer is COMMIT. A missing one is UNKNOWN while the half
/// message is younger than `rollback_unresolved_after` (the debit may still
/// be in progress) and ROLLBACK afterwards.
pub struct TransferTransaction {
    journal: Arc<dyn TransferJournal>,
    rollback_unresolved_after: Duration,
}

impl TransferTransaction {
    pub fn new(journal: Arc<dyn TransferJournal>, rollback_unresolved_after: Duration) -> Self {
        Self {
            journal,
            rollback_unresolved_after,
        }
    }

    pub fn from_config(journal: Arc<dyn TransferJournal>, config: &CoordinatorConfig) -> Self {
        Self::new(journal, config.rollback_unresolved_after())
    }
}

#[async_trait]
impl LocalTransaction for TransferTransaction {
    async fn execute(&self, event: &TransferEvent) -> anyhow::Result<TransactionState> {
        match self.journal.record_debit(event).await {
            Ok(()) => Ok(TransactionState::Commit),
            Err(e @ (StoreError::AccountNotFound(_) | StoreError::InsufficientBalance(_))) => {
                info!(
                    transaction_id = %event.transaction_id(),
                    code = e.code(),
                    "Transfer refused, rolling back"
                );
                Ok(TransactionState::Rollback)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check(
        &self,
        event: &TransferEvent,
        born_at: DateTime<Utc>,
    ) -> anyhow::Result<TransactionState> {
        if self.journal.is_committed(event.transaction_id()).await? {
            return Ok(TransactionState::Commit);
        }

        // Clock skew can make the half look younger than zero
        let age = (Utc::now() - born_at).to_std().unwrap_or(Duration::ZERO);
        if age >= self.rollback_unresolved_after {
            debug!(
                transaction_id = %event.transaction_id(),
                age_ms = age.as_millis() as u64,
                "No journal entry past grace window"
            );
            Ok(TransactionState::Rollback)
        } else {
            Ok(TransactionState::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    fn setup(grace: Duration) -> (Arc<Ledger>, TransferTransaction) {
        let ledger = Arc::new(Ledger::new());
        ledger.open_account(1, 500).unwrap();
        ledger.open_account(2, 0).unwrap();
        let tx = TransferTransaction::new(ledger.clone(), grace);
        (ledger, tx)
    }

    #[tokio::test]
    async fn test_execute_commit_and_rollback() {
        let (ledger, tx) = setup(Duration::from_secs(30));

        let ok = TransferEvent::with_ids("R-1", "TX-1", 1, 2, 200);
        assert_eq!(tx.execute(&ok).await.unwrap(), TransactionState::Commit);
        assert_eq!(ledger.balance(1).unwrap(), Some(300));

        let too_much = TransferEvent::with_ids("R-2", "TX-2", 1, 2, 10_000);
        assert_eq!(
            tx.execute(&too_much).await.unwrap(),
            TransactionState::Rollback
        );

        let no_source = TransferEvent::with_ids("R-3", "TX-3", 42, 2, 1);
        assert_eq!(
            tx.execute(&no_source).await.unwrap(),
            TransactionState::Rollback
        );
    }

    #[tokio::test]
    async fn test_execute_store_outage_is_error() {
        let (ledger, tx) = setup(Duration::from_secs(30));
        ledger.set_available(false);

        let event = TransferEvent::with_ids("R-1", "TX-1", 1, 2, 200);
        assert!(tx.execute(&event).await.is_err());
    }

    #[tokio::test]
    async fn test_check_uses_grace_window() {
        let (ledger, tx) = setup(Duration::from_secs(30));
        let event = TransferEvent::with_ids("R-1", "TX-1", 1, 2, 200);

        let fresh = Utc::now();
        let stale = Utc::now() - chrono::Duration::seconds(60);

        assert_eq!(tx.check(&event, fresh).await.unwrap(), TransactionState::Unknown);
        assert_eq!(tx.check(&event, stale).await.unwrap(), TransactionState::Rollback);

        tx.execute(&event).await.unwrap();
        assert_eq!(tx.check(&event, stale).await.unwrap(), TransactionState::Commit);
        // Checks never debit again
        assert_eq!(ledger.balance(1).unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_check_store_outage_is_error() {
        let (ledger, tx) = setup(Duration::ZERO);
        ledger.set_available(false);

        let event = TransferEvent::with_ids("R-1", "TX-1", 1, 2, 200);
        assert!(tx.check(&event, Utc::now()).await.is_err());
    }
}
