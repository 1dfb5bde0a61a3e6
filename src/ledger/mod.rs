//! Ledger
//!
//! Systems of record on both sides of the outbox:
//! - [`TransferJournal`]: producer side, debits the source account and
//!   records the transfer as committed
//! - [`AccountStore`]: consumer side, loads accounts and credits the target
//!
//! All operations MUST be atomic per call.

pub mod in_memory;
pub mod local_tx;

pub use in_memory::{JournalEntry, Ledger};
pub use local_tx::TransferTransaction;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::TransferEvent;

/// Account row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    /// Balance in minor units
    pub balance: u64,
}

/// Ledger failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    AccountNotFound(u64),

    #[error("Insufficient balance in account {0}")]
    InsufficientBalance(u64),

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            StoreError::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            StoreError::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            StoreError::Unavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    /// Whether the same call may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Consumer-side business store
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Load an account, `None` when it does not exist
    async fn load(&self, account_id: u64) -> Result<Option<Account>, StoreError>;

    /// Credit `amount` to `account_id`
    ///
    /// Returns the number of rows changed: 0 when the account does not exist.
    async fn apply_effect(&self, account_id: u64, amount: u64) -> Result<u64, StoreError>;
}

/// Producer-side system of record
#[async_trait]
pub trait TransferJournal: Send + Sync {
    /// Debit the source account and journal the transfer in one step
    ///
    /// # Idempotency
    /// Recording an already journaled `transaction_id` succeeds without a
    /// second debit.
    async fn record_debit(&self, event: &TransferEvent) -> Result<(), StoreError>;

    /// Whether the transfer with `transaction_id` committed
    async fn is_committed(&self, transaction_id: &str) -> Result<bool, StoreError>;
}
