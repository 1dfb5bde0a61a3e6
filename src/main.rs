//! Transfer Outbox - demo run
//!
//! Publishes transfers through the transactional outbox and consumes them
//! with the configured listener, all in one process:
//!
//! ```text
//! ┌──────────────┐  half msg  ┌──────────┐  batch  ┌──────────┐  lane  ┌─────────┐
//! │ Coordinator  │───────────▶│  Broker  │────────▶│ Listener │───────▶│ Handler │
//! │ (debit+jrnl) │◀───────────│          │◀────────│          │        │(credit) │
//! └──────────────┘  check-back└──────────┘   ack   └──────────┘        └─────────┘
//! ```
//!
//! Every fifth local transaction commits and then fails before reporting,
//! so its outcome is recovered through check-back.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use transfer_outbox::config::AppConfig;
use transfer_outbox::consumer::{
    InMemoryDeadLetters, InMemoryIdempotencyStore, MessageHandler, build_listener,
};
use transfer_outbox::dispatch::KeyedDispatcher;
use transfer_outbox::ledger::{Ledger, TransferTransaction};
use transfer_outbox::transaction::{
    CheckBackConfig, CheckBackWorker, LocalTransaction, TransactionCoordinator, TransactionState,
    TransferEvent,
};
use transfer_outbox::{InMemoryBroker, logging};

const ACCOUNTS: u64 = 10;
const OPENING_BALANCE: u64 = 10_000;
const ORDER_KEYS: usize = 10;
const CRASH_EVERY: usize = 5;

// ============================================================
// ARGS
// ============================================================

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_transfers() -> usize {
    get_arg(&["--transfers"])
        .and_then(|n| n.parse().ok())
        .unwrap_or(50)
}

// ============================================================
// CRASHING PRODUCER
// ============================================================

/// Runs the real local transaction but loses the decision every `every`
/// commits, as if the producer died right after the database commit
struct CrashAfterCommit {
    inner: TransferTransaction,
    every: usize,
    commits: AtomicUsize,
}

#[async_trait]
impl LocalTransaction for CrashAfterCommit {
    async fn execute(&self, event: &TransferEvent) -> anyhow::Result<TransactionState> {
        let state = self.inner.execute(event).await?;
        if state == TransactionState::Commit {
            let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
            if n % self.every == 0 {
                anyhow::bail!("producer crashed after commit");
            }
        }
        Ok(state)
    }

    async fn check(
        &self,
        event: &TransferEvent,
        born_at: DateTime<Utc>,
    ) -> anyhow::Result<TransactionState> {
        self.inner.check(event, born_at).await
    }
}

/// Deterministic transfer `i`: every seventh one overdraws its source
fn transfer(i: usize) -> TransferEvent {
    let from = (i as u64 % ACCOUNTS) + 1;
    let to = ((i as u64 * 3 + 1) % ACCOUNTS) + 1;
    let to = if to == from { to % ACCOUNTS + 1 } else { to };
    let amount = if i % 7 == 6 {
        OPENING_BALANCE * 10
    } else {
        100 + (i as u64 * 37) % 400
    };
    TransferEvent::new(from, to, amount)
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config =
        AppConfig::load(&env).with_context(|| format!("loading configuration for env {env}"))?;
    let _log_guard = logging::init_logging(&config);

    info!(
        env = %env,
        topic = %config.broker.topic,
        mode = ?config.consumer.mode,
        parallelism = config.dispatcher.parallelism,
        "Starting transfer outbox"
    );

    let ledger = Arc::new(Ledger::new());
    for id in 1..=ACCOUNTS {
        ledger.open_account(id, OPENING_BALANCE)?;
    }
    let opening_total = ledger.total_balance()?;

    // Producer
    let broker = Arc::new(InMemoryBroker::new(config.broker.clone()));
    let local = Arc::new(CrashAfterCommit {
        inner: TransferTransaction::from_config(ledger.clone(), &config.coordinator),
        every: CRASH_EVERY,
        commits: AtomicUsize::new(0),
    });
    let coordinator = Arc::new(TransactionCoordinator::from_config(
        broker.clone(),
        local,
        &config.broker,
    ));

    let transfers = get_transfers();
    let started = Instant::now();
    let (mut committed, mut rolled_back, mut unknown, mut failed) = (0usize, 0usize, 0usize, 0usize);

    for i in 0..transfers {
        let order_key = format!("order{}", i % ORDER_KEYS);
        let event = transfer(i);
        match coordinator
            .publish_transactional(&event, Some(&order_key))
            .await
        {
            Ok(outcome) => match outcome.state {
                TransactionState::Commit => committed += 1,
                TransactionState::Rollback => rolled_back += 1,
                TransactionState::Unknown => unknown += 1,
            },
            Err(e) => {
                warn!(record_no = %event.record_no(), code = e.code(), error = %e, "Publish failed");
                failed += 1;
            }
        }
    }

    info!(
        transfers,
        committed,
        rolled_back,
        unknown,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Producer finished"
    );

    // Check-back resolves the halves whose decision was lost
    let worker = CheckBackWorker::new(
        coordinator.clone(),
        broker.clone(),
        CheckBackConfig::from(&config.coordinator),
    );
    let sweep = worker.sweep_once().await?;

    // Consumer
    let dispatcher = Arc::new(
        KeyedDispatcher::new(config.dispatcher.parallelism).with_name(&config.dispatcher.name),
    );
    let reclaimer = dispatcher.spawn_reclaimer(config.dispatcher.reclaim_interval());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let handler = Arc::new(MessageHandler::new(ledger.clone(), idempotency.clone()));
    let dead_letters = Arc::new(InMemoryDeadLetters::new());
    let listener = build_listener(
        &config.consumer,
        handler,
        dispatcher.clone(),
        dead_letters.clone(),
    );
    broker.subscribe(listener);

    let delivery = broker.deliver_pending(transfers.saturating_mul(4) + 16).await;

    let report = dispatcher.shutdown(config.dispatcher.drain_timeout()).await;
    reclaimer.abort();

    let closing_total = ledger.total_balance()?;
    for id in 1..=ACCOUNTS {
        let balance = ledger.balance(id)?.unwrap_or_default();
        info!(account = id, balance, "Closing balance");
    }

    info!(
        committed_by_check_back = sweep.committed,
        rolled_back_by_check_back = sweep.rolled_back,
        still_unresolved = broker.unresolved_len(),
        delivered = delivery.delivered,
        acked = delivery.acked,
        redelivered = delivery.redelivered,
        applied = idempotency.applied_count(),
        dead_letters = dead_letters.len() + broker.dead_letters().len(),
        drained = report.drained,
        opening_total,
        closing_total,
        "Run finished"
    );

    if opening_total != closing_total {
        warn!(
            opening_total,
            closing_total,
            pending = broker.pending_len(),
            "Money in flight: not every committed debit was credited"
        );
    }

    Ok(())
}
