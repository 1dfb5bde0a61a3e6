//! Dead-letter sinks for messages that will never be applied

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tracing::warn;

use crate::messages::DeliveredMessage;

/// A message parked for manual inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub msg_id: String,
    pub keys: String,
    pub reason: String,
    pub body: Vec<u8>,
    pub reconsume_times: u32,
    pub parked_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: &DeliveredMessage, reason: impl Into<String>) -> Self {
        Self {
            msg_id: message.msg_id.clone(),
            keys: message.keys.clone(),
            reason: reason.into(),
            body: message.body.clone(),
            reconsume_times: message.reconsume_times,
            parked_at: Utc::now(),
        }
    }
}

/// Receives rejected messages; the message counts as consumed afterwards
pub trait DeadLetterSink: Send + Sync {
    fn publish(&self, letter: DeadLetter);
}

/// Logs each dead letter at `warn`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeadLetterSink;

impl DeadLetterSink for LogDeadLetterSink {
    fn publish(&self, letter: DeadLetter) {
        warn!(
            msg_id = %letter.msg_id,
            keys = %letter.keys,
            reason = %letter.reason,
            body = %String::from_utf8_lossy(&letter.body),
            "Message dead-lettered"
        );
    }
}

/// Keeps dead letters in memory, for tests and the demo summary
#[derive(Debug, Default)]
pub struct InMemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|letters| letters.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn publish(&self, letter: DeadLetter) {
        LogDeadLetterSink.publish(letter.clone());
        if let Ok(mut letters) = self.letters.lock() {
            letters.push(letter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::OutboundMessage;

    #[test]
    fn test_in_memory_dead_letters() {
        let sink = InMemoryDeadLetters::new();
        assert!(sink.is_empty());

        let message = DeliveredMessage::from_outbound(
            "M-1",
            OutboundMessage::new("T", "*", "R-1", b"not json".to_vec()),
        );
        sink.publish(DeadLetter::new(&message, "MALFORMED_PAYLOAD"));

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].msg_id, "M-1");
        assert_eq!(letters[0].reason, "MALFORMED_PAYLOAD");
    }
}
