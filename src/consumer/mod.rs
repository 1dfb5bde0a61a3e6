//! Consumer Side
//!
//! Delivered transfer events are applied to the target account exactly once
//! per record number, in order per correlation key.
//!
//! # Flow
//!
//! ```text
//! broker batch ─▶ MessageListener ─▶ KeyedDispatcher lane ─▶ MessageHandler
//!                      ▲                                          │
//!                      └──────── ConsumeStatus ◀── outcomes ──────┘
//! ```
//!
//! # Outcomes
//! - APPLIED / ALREADY_APPLIED: consumed
//! - REJECTED: dead-lettered, consumed
//! - RETRY: batch reconsumed later

pub mod dead_letter;
pub mod handler;
pub mod idempotency;
pub mod listener;

pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetters, LogDeadLetterSink};
pub use handler::{HandleOutcome, MessageHandler, RejectReason};
pub use idempotency::{ClaimOutcome, IdempotencyStore, InMemoryIdempotencyStore};
pub use listener::{
    ConcurrentListener, ConsumeStatus, KeyOrderedListener, MessageListener, build_listener,
};
