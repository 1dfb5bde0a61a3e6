//! Transfer Outbox - transactional messaging for transfer events
//!
//! A transfer event becomes visible to consumers if and only if the local
//! transaction that produced it committed, and each event is applied to the
//! target account at most once, in order per correlation key.
//!
//! # Modules
//!
//! - [`transaction`] - Transaction coordinator, check-back worker
//! - [`dispatch`] - Key-ordered concurrent dispatcher
//! - [`consumer`] - Idempotent handler, idempotency store, listeners
//! - [`ledger`] - Account store and transfer journal
//! - [`broker`] - Transport seams and the in-process broker
//! - [`messages`] - Transport-level message types
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod ledger;
pub mod logging;
pub mod messages;
pub mod transaction;

// Convenient re-exports at crate root
pub use broker::{CheckBackSource, DeliveryStats, InMemoryBroker, Transport};
pub use config::{AppConfig, ConfigError, ListenerMode};
pub use consumer::{
    ConsumeStatus, HandleOutcome, IdempotencyStore, InMemoryIdempotencyStore, MessageHandler,
    MessageListener, RejectReason, build_listener,
};
pub use dispatch::{DispatchError, DrainReport, KeyedDispatcher, LaneTaskFailure, UNKNOWN_KEY};
pub use ledger::{Account, AccountStore, Ledger, StoreError, TransferJournal, TransferTransaction};
pub use messages::{DeliveredMessage, HalfMessage, OutboundMessage, PublishMode, SendReceipt};
pub use transaction::{
    CheckBackWorker, DeliveryOutcome, LocalTransaction, PublishError, TransactionCoordinator,
    TransactionState, TransferEvent, TransportError,
};
