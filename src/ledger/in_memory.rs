//! In-memory ledger implementing both sides of the outbox

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{Account, AccountStore, StoreError, TransferJournal};
use crate::transaction::TransferEvent;

/// A committed transfer on the producer side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub transaction_id: String,
    pub record_no: String,
    pub from_account: u64,
    pub to_account: u64,
    pub amount: u64,
    pub committed_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    accounts: FxHashMap<u64, Account>,
    /// transaction_id → entry
    journal: FxHashMap<String, JournalEntry>,
}

/// Accounts plus transfer journal behind one lock
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], simulating a lost database.
pub struct Ledger {
    state: Mutex<LedgerState>,
    available: AtomicBool,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("ledger offline".to_string()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("ledger lock poisoned".to_string()))
    }

    /// Create (or reset) an account with an opening balance
    pub fn open_account(&self, account_id: u64, balance: u64) -> Result<(), StoreError> {
        self.lock()?.accounts.insert(
            account_id,
            Account {
                id: account_id,
                balance,
            },
        );
        Ok(())
    }

    pub fn balance(&self, account_id: u64) -> Result<Option<u64>, StoreError> {
        Ok(self.lock()?.accounts.get(&account_id).map(|a| a.balance))
    }

    /// Sum of all balances
    pub fn total_balance(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.accounts.values().map(|a| a.balance).sum())
    }

    pub fn journal_entry(&self, transaction_id: &str) -> Result<Option<JournalEntry>, StoreError> {
        Ok(self.lock()?.journal.get(transaction_id).cloned())
    }

    pub fn journal_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.journal.len())
    }
}

#[async_trait]
impl AccountStore for Ledger {
    async fn load(&self, account_id: u64) -> Result<Option<Account>, StoreError> {
        self.check_available()?;
        Ok(self.lock()?.accounts.get(&account_id).copied())
    }

    async fn apply_effect(&self, account_id: u64, amount: u64) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.lock()?;

        let Some(account) = state.accounts.get_mut(&account_id) else {
            return Ok(0);
        };
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(StoreError::BalanceOverflow(account_id))?;

        debug!(account_id, amount, balance = account.balance, "Account credited");
        Ok(1)
    }
}

#[async_trait]
impl TransferJournal for Ledger {
    async fn record_debit(&self, event: &TransferEvent) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock()?;

        if state.journal.contains_key(event.transaction_id()) {
            return Ok(());
        }

        let from = event.from_account();
        let account = state
            .accounts
            .get_mut(&from)
            .ok_or(StoreError::AccountNotFound(from))?;
        account.balance = account
            .balance
            .checked_sub(event.amount())
            .ok_or(StoreError::InsufficientBalance(from))?;

        state.journal.insert(
            event.transaction_id().to_string(),
            JournalEntry {
                transaction_id: event.transaction_id().to_string(),
                record_no: event.record_no().to_string(),
                from_account: from,
                to_account: event.to_account(),
                amount: event.amount(),
                committed_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn is_committed(&self, transaction_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.lock()?.journal.contains_key(transaction_id))
    }
}
