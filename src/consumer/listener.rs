//! Message Listeners
//!
//! Batch consumption strategies. The broker hands a batch to
//! [`MessageListener::consume`] and acts on the returned status for the
//! whole batch.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::handler::{HandleOutcome, MessageHandler};
use crate::config::{ConsumerConfig, ListenerMode};
use crate::dispatch::{KeyedDispatcher, UNKNOWN_KEY};
use crate::messages::DeliveredMessage;

/// Acknowledgement for a delivered batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    /// Every message of the batch is done with
    ConsumeSuccess,
    /// Redeliver the batch later
    ReconsumeLater,
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Get listener name for logging
    fn name(&self) -> &'static str;

    async fn consume(&self, batch: Vec<DeliveredMessage>) -> ConsumeStatus;
}

fn dead_letter(sink: &dyn DeadLetterSink, message: &DeliveredMessage, outcome: &HandleOutcome) {
    if let HandleOutcome::Rejected(reason) = outcome {
        sink.publish(DeadLetter::new(message, reason.code()));
    }
}

// ============================================================
// CONCURRENT (unordered across batches)
// ============================================================

/// Handles a batch in delivery order on the delivering task
///
/// The first RETRY stops the batch; messages already applied are absorbed
/// as duplicates on redelivery.
pub struct ConcurrentListener {
    handler: Arc<MessageHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl ConcurrentListener {
    pub fn new(handler: Arc<MessageHandler>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            handler,
            dead_letters,
        }
    }
}

#[async_trait]
impl MessageListener for ConcurrentListener {
    fn name(&self) -> &'static str {
        "concurrent"
    }

    async fn consume(&self, batch: Vec<DeliveredMessage>) -> ConsumeStatus {
        for message in &batch {
            let outcome = self.handler.handle(message).await;
            if outcome.is_retry() {
                debug!(msg_id = %message.msg_id, batch = batch.len(), "Batch will be reconsumed");
                return ConsumeStatus::ReconsumeLater;
            }
            dead_letter(self.dead_letters.as_ref(), message, &outcome);
        }
        ConsumeStatus::ConsumeSuccess
    }
}

// ============================================================
// KEY-ORDERED
// ============================================================

/// Fans a batch out over the dispatcher by correlation key
///
/// The batch is acknowledged only after every message has an outcome. Any
/// RETRY, any task the dispatcher dropped, or a refused submission makes the
/// whole batch ReconsumeLater.
///
/// Once a key gets RETRY, its later messages in the same batch are not
/// handled and report RETRY too, so nothing overtakes the failed message.
pub struct KeyOrderedListener {
    handler: Arc<MessageHandler>,
    dispatcher: Arc<KeyedDispatcher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    key_property: String,
}

impl KeyOrderedListener {
    pub fn new(
        handler: Arc<MessageHandler>,
        dispatcher: Arc<KeyedDispatcher>,
        dead_letters: Arc<dyn DeadLetterSink>,
        key_property: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            dispatcher,
            dead_letters,
            key_property: key_property.into(),
        }
    }

    /// Correlation key: key property, else message keys, else [`UNKNOWN_KEY`]
    pub fn key_of<'a>(&self, message: &'a DeliveredMessage) -> &'a str {
        message
            .property(&self.key_property)
            .filter(|key| !key.is_empty())
            .or_else(|| Some(message.keys.as_str()).filter(|key| !key.is_empty()))
            .unwrap_or(UNKNOWN_KEY)
    }
}

#[async_trait]
impl MessageListener for KeyOrderedListener {
    fn name(&self) -> &'static str {
        "key_ordered"
    }

    async fn consume(&self, batch: Vec<DeliveredMessage>) -> ConsumeStatus {
        let batch_len = batch.len();
        let mut replies = Vec::with_capacity(batch_len);
        let mut status = ConsumeStatus::ConsumeSuccess;
        // Keys with a RETRY in this batch
        let blocked: Arc<DashSet<String>> = Arc::new(DashSet::new());

        for message in batch {
            let key = self.key_of(&message).to_string();
            let (reply, outcome) = oneshot::channel();
            let handler = Arc::clone(&self.handler);
            let dead_letters = Arc::clone(&self.dead_letters);
            let blocked = Arc::clone(&blocked);
            let lane_key = key.clone();

            let submitted = self.dispatcher.submit(&key, async move {
                if blocked.contains(&lane_key) {
                    debug!(key = %lane_key, msg_id = %message.msg_id, "Earlier message of key needs retry, skipped");
                    let _ = reply.send(HandleOutcome::Retry);
                    return Ok(());
                }

                let outcome = handler.handle(&message).await;
                if outcome.is_retry() {
                    blocked.insert(lane_key);
                }
                dead_letter(dead_letters.as_ref(), &message, &outcome);
                // Listener gone means the batch is already being reconsumed
                let _ = reply.send(outcome);
                Ok(())
            });

            match submitted {
                Ok(()) => replies.push(outcome),
                Err(e) => {
                    warn!(key = %key, code = e.code(), "Submission refused, batch will be reconsumed");
                    status = ConsumeStatus::ReconsumeLater;
                    break;
                }
            }
        }

        // Wait for everything already submitted, even after a refusal
        for outcome in futures::future::join_all(replies).await {
            match outcome {
                Ok(outcome) if !outcome.is_retry() => {}
                Ok(_) => status = ConsumeStatus::ReconsumeLater,
                Err(_) => {
                    debug!("Task dropped before reporting an outcome");
                    status = ConsumeStatus::ReconsumeLater;
                }
            }
        }

        if status == ConsumeStatus::ReconsumeLater {
            debug!(batch = batch_len, "Batch will be reconsumed");
        }
        status
    }
}

/// Build the listener selected by `consumer.mode`
pub fn build_listener(
    config: &ConsumerConfig,
    handler: Arc<MessageHandler>,
    dispatcher: Arc<KeyedDispatcher>,
    dead_letters: Arc<dyn DeadLetterSink>,
) -> Arc<dyn MessageListener> {
    match config.mode {
        ListenerMode::Concurrent => Arc::new(ConcurrentListener::new(handler, dead_letters)),
        ListenerMode::KeyOrdered => Arc::new(KeyOrderedListener::new(
            handler,
            dispatcher,
            dead_letters,
            &config.key_property,
        )),
    }
}
