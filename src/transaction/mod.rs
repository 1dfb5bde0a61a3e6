//! Transactional Publish
//!
//! Producer side of the outbox: a transfer event becomes visible to
//! subscribers if and only if the local transaction that produced it
//! committed.
//!
//! # Protocol
//!
//! ```text
//! send(Prepare) ──▶ execute local ──▶ end_transaction(COMMIT | ROLLBACK | UNKNOWN)
//!                                               │
//!                                   UNKNOWN ────┴──▶ check-back ──▶ COMMIT | ROLLBACK
//! ```
//!
//! # Safety Invariants
//!
//! 1. **No Visibility Before Commit**: the event is sent as a hidden half
//!    message and only released on COMMIT
//! 2. **Unknown Is Not Rollback**: errors, panics and lost decisions report
//!    UNKNOWN, never ROLLBACK
//! 3. **Checks Are Read-Only**: check-back re-derives the outcome from the
//!    system of record and never re-runs the business effect

pub mod coordinator;
pub mod error;
pub mod local;
pub mod state;
pub mod types;
pub mod worker;

pub use coordinator::TransactionCoordinator;
pub use error::{CodecError, PublishError, TransportError};
pub use local::LocalTransaction;
pub use state::TransactionState;
pub use types::{DeliveryOutcome, TransferEvent};
pub use worker::{CheckBackConfig, CheckBackStats, CheckBackWorker};
