//! In-process broker
//!
//! Single-topic broker with the half-message protocol, check-back and
//! at-least-once delivery with redelivery and dead-lettering.
//!
//! ```text
//! send(Prepare) ─▶ halves ──COMMIT──▶ ready ──deliver──▶ listener
//!                    │                  ▲                   │
//!                    ROLLBACK (drop)    └─ ReconsumeLater ──┘ (front, until max_reconsume_times)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::{CheckBackSource, Transport};
use crate::config::BrokerConfig;
use crate::consumer::{ConsumeStatus, MessageListener};
use crate::messages::{DeliveredMessage, HalfMessage, OutboundMessage, PublishMode, SendReceipt};
use crate::transaction::{TransactionState, TransportError};

/// Counts from one or more delivery rounds
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub acked: usize,
    pub redelivered: usize,
    pub dead_lettered: usize,
}

impl DeliveryStats {
    fn merge(&mut self, other: DeliveryStats) {
        self.delivered += other.delivered;
        self.acked += other.acked;
        self.redelivered += other.redelivered;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Default)]
struct BrokerState {
    /// Undecided halves, ordered by msg id (ULIDs sort by creation)
    halves: BTreeMap<String, HalfMessage>,
    /// Final decision of every half that left `halves`
    decisions: FxHashMap<String, TransactionState>,
    ready: VecDeque<DeliveredMessage>,
    dead_letters: Vec<DeliveredMessage>,
    acked: usize,
}

impl BrokerState {
    fn decide(&mut self, msg_id: &str, state: TransactionState) -> Result<(), TransportError> {
        if let Some(decided) = self.decisions.get(msg_id) {
            return if state == TransactionState::Unknown || decided.can_transition_to(state) {
                Ok(())
            } else {
                Err(TransportError::AlreadyDecided(*decided))
            };
        }

        if !self.halves.contains_key(msg_id) {
            return Err(TransportError::UnknownMessage(msg_id.to_string()));
        }

        match state {
            TransactionState::Unknown => {}
            TransactionState::Commit => {
                if let Some(half) = self.halves.remove(msg_id) {
                    let mut message = DeliveredMessage::from_outbound(half.msg_id, half.message);
                    message.born_at = half.born_at;
                    self.ready.push_back(message);
                }
                self.decisions.insert(msg_id.to_string(), state);
            }
            TransactionState::Rollback => {
                self.halves.remove(msg_id);
                self.decisions.insert(msg_id.to_string(), state);
            }
        }
        Ok(())
    }
}

/// In-process broker for one topic
pub struct InMemoryBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    available: AtomicBool,
    subscriber: Mutex<Option<Arc<dyn MessageListener>>>,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BrokerState::default()),
            available: AtomicBool::new(true),
            subscriber: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Simulate the broker going away; sends and decisions fail while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("broker unreachable".to_string()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the listener used by [`deliver_pending`](Self::deliver_pending)
    pub fn subscribe(&self, listener: Arc<dyn MessageListener>) {
        info!(
            topic = %self.config.topic,
            tag = %self.config.tag,
            consumer_group = %self.config.consumer_group,
            listener = listener.name(),
            "Listener subscribed"
        );
        *self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Deliver to the subscribed listener until nothing is ready
    pub async fn deliver_pending(&self, max_rounds: usize) -> DeliveryStats {
        let listener = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => self.drain(listener.as_ref(), max_rounds).await,
            None => {
                warn!(topic = %self.config.topic, "No subscriber, nothing delivered");
                DeliveryStats::default()
            }
        }
    }

    /// Hand one batch of ready messages to `listener`
    ///
    /// A ReconsumeLater batch goes back to the front of the queue in its
    /// original order, so per-key order survives redelivery. Messages past
    /// `max_reconsume_times` are dead-lettered instead.
    pub async fn deliver_once(&self, listener: &dyn MessageListener) -> DeliveryStats {
        let batch: Vec<DeliveredMessage> = {
            let mut state = self.lock();
            let n = self.config.batch_size.max(1).min(state.ready.len());
            state.ready.drain(..n).collect()
        };

        if batch.is_empty() {
            return DeliveryStats::default();
        }

        let mut stats = DeliveryStats {
            delivered: batch.len(),
            ..DeliveryStats::default()
        };

        let status = listener.consume(batch.clone()).await;

        let mut state = self.lock();
        match status {
            ConsumeStatus::ConsumeSuccess => {
                state.acked += batch.len();
                stats.acked = batch.len();
            }
            ConsumeStatus::ReconsumeLater => {
                for mut message in batch.into_iter().rev() {
                    if message.reconsume_times >= self.config.max_reconsume_times {
                        warn!(
                            msg_id = %message.msg_id,
                            keys = %message.keys,
                            reconsume_times = message.reconsume_times,
                            "Redelivery exhausted, moved to dead-letter queue"
                        );
                        state.dead_letters.push(message);
                        stats.dead_lettered += 1;
                    } else {
                        message.reconsume_times += 1;
                        state.ready.push_front(message);
                        stats.redelivered += 1;
                    }
                }
            }
        }

        debug!(
            listener = listener.name(),
            delivered = stats.delivered,
            acked = stats.acked,
            redelivered = stats.redelivered,
            dead_lettered = stats.dead_lettered,
            "Batch delivered"
        );
        stats
    }

    /// Deliver until nothing is ready or `max_rounds` batches were handed out
    pub async fn drain(&self, listener: &dyn MessageListener, max_rounds: usize) -> DeliveryStats {
        let mut total = DeliveryStats::default();
        for _ in 0..max_rounds {
            if self.pending_len() == 0 {
                break;
            }
            total.merge(self.deliver_once(listener).await);
        }
        total
    }

    /// Messages ready for delivery
    pub fn pending_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Halves still waiting for a decision
    pub fn unresolved_len(&self) -> usize {
        self.lock().halves.len()
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn dead_letters(&self) -> Vec<DeliveredMessage> {
        self.lock().dead_letters.clone()
    }

    /// Decision for a half message, `Unknown` while still pending
    pub fn state_of(&self, msg_id: &str) -> Option<TransactionState> {
        let state = self.lock();
        if state.halves.contains_key(msg_id) {
            Some(TransactionState::Unknown)
        } else {
            state.decisions.get(msg_id).copied()
        }
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn send(
        &self,
        message: OutboundMessage,
        mode: PublishMode,
    ) -> Result<SendReceipt, TransportError> {
        self.check_available()?;
        if message.topic != self.config.topic {
            return Err(TransportError::Rejected(format!(
                "topic {} not served",
                message.topic
            )));
        }

        let msg_id = ulid::Ulid::new().to_string();
        let receipt = SendReceipt {
            msg_id: msg_id.clone(),
            topic: message.topic.clone(),
        };

        let mut state = self.lock();
        match mode {
            PublishMode::Normal => {
                state
                    .ready
                    .push_back(DeliveredMessage::from_outbound(msg_id, message));
            }
            PublishMode::Prepare => {
                state.halves.insert(
                    msg_id.clone(),
                    HalfMessage {
                        msg_id,
                        message,
                        born_at: Utc::now(),
                        check_times: 0,
                    },
                );
            }
        }
        Ok(receipt)
    }

    async fn end_transaction(
        &self,
        receipt: &SendReceipt,
        state: TransactionState,
    ) -> Result<(), TransportError> {
        self.check_available()?;
        self.lock().decide(&receipt.msg_id, state)
    }
}

#[async_trait]
impl CheckBackSource for InMemoryBroker {
    async fn unresolved(&self, limit: usize) -> Result<Vec<HalfMessage>, TransportError> {
        self.check_available()?;
        let max_check_times = self.config.max_check_times;
        let mut state = self.lock();

        let exhausted: Vec<String> = state
            .halves
            .values()
            .filter(|half| half.check_times >= max_check_times)
            .map(|half| half.msg_id.clone())
            .collect();
        for msg_id in exhausted {
            warn!(msg_id = %msg_id, max_check_times, "Check-back exhausted, rolling back half");
            state.decide(&msg_id, TransactionState::Rollback)?;
        }

        Ok(state
            .halves
            .values_mut()
            .take(limit)
            .map(|half| {
                half.check_times += 1;
                half.clone()
            })
            .collect())
    }

    async fn resolve(&self, msg_id: &str, state: TransactionState) -> Result<(), TransportError> {
        self.check_available()?;
        self.lock().decide(msg_id, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new(BrokerConfig {
            batch_size: 2,
            max_reconsume_times: 1,
            max_check_times: 2,
            ..BrokerConfig::default()
        })
    }

    fn outbound(keys: &str) -> OutboundMessage {
        OutboundMessage::new("TransactionMessage", "*", keys, b"{}".to_vec())
    }

    struct Scripted {
        status: ConsumeStatus,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageListener for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn consume(&self, _batch: Vec<DeliveredMessage>) -> ConsumeStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.status
        }
    }

    #[tokio::test]
    async fn test_half_hidden_until_commit() {
        let broker = broker();
        let receipt = broker.send(outbound("R-1"), PublishMode::Prepare).await.unwrap();

        assert_eq!(broker.pending_len(), 0);
        assert_eq!(broker.state_of(&receipt.msg_id), Some(TransactionState::Unknown));

        broker
            .end_transaction(&receipt, TransactionState::Commit)
            .await
            .unwrap();
        assert_eq!(broker.pending_len(), 1);
        assert_eq!(broker.unresolved_len(), 0);
    }

    #[tokio::test]
    async fn test_decided_half_refuses_other_decision() {
        let broker = broker();
        let receipt = broker.send(outbound("R-1"), PublishMode::Prepare).await.unwrap();

        broker
            .end_transaction(&receipt, TransactionState::Rollback)
            .await
            .unwrap();
        assert_eq!(broker.pending_len(), 0);

        // Same decision again is harmless
        assert!(broker.resolve(&receipt.msg_id, TransactionState::Rollback).await.is_ok());
        assert_eq!(
            broker.resolve(&receipt.msg_id, TransactionState::Commit).await,
            Err(TransportError::AlreadyDecided(TransactionState::Rollback))
        );
        assert_eq!(
            broker.resolve("nope", TransactionState::Commit).await,
            Err(TransportError::UnknownMessage("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unresolved_counts_checks_and_expires() {
        let broker = broker();
        let receipt = broker.send(outbound("R-1"), PublishMode::Prepare).await.unwrap();

        assert_eq!(broker.unresolved(10).await.unwrap()[0].check_times, 1);
        assert_eq!(broker.unresolved(10).await.unwrap()[0].check_times, 2);
        assert!(broker.unresolved(10).await.unwrap().is_empty());
        assert_eq!(broker.state_of(&receipt.msg_id), Some(TransactionState::Rollback));
    }

    #[tokio::test]
    async fn test_send_rejects_foreign_topic_and_outage() {
        let broker = broker();
        let foreign = OutboundMessage::new("Other", "*", "R-1", Vec::new());
        assert!(matches!(
            broker.send(foreign, PublishMode::Normal).await,
            Err(TransportError::Rejected(_))
        ));

        broker.set_available(false);
        assert!(matches!(
            broker.send(outbound("R-1"), PublishMode::Normal).await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_redelivery_then_dead_letter() {
        let broker = broker();
        broker.send(outbound("R-1"), PublishMode::Normal).await.unwrap();
        let listener = Scripted {
            status: ConsumeStatus::ReconsumeLater,
            calls: AtomicUsize::new(0),
        };

        let stats = broker.drain(&listener, 10).await;

        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_letters()[0].keys, "R-1");
        assert_eq!(broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size() {
        let broker = broker();
        for i in 0..5 {
            broker
                .send(outbound(&format!("R-{i}")), PublishMode::Normal)
                .await
                .unwrap();
        }
        let listener = Arc::new(Scripted {
            status: ConsumeStatus::ConsumeSuccess,
            calls: AtomicUsize::new(0),
        });
        broker.subscribe(listener.clone());

        let stats = broker.deliver_pending(10).await;

        assert_eq!(listener.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.acked, 5);
        assert_eq!(broker.acked(), 5);
    }
}
