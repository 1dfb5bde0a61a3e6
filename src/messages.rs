//! Messages - Transport-level message types
//!
//! Shapes exchanged with the broker on both sides of the outbox.
//!
//! # Message Flow
//!
//! ```text
//! Producer ─ OutboundMessage(Prepare) ─▶ Broker ── HalfMessage ──▶ check-back
//!                                          │
//!                                          └─ DeliveredMessage ─▶ MessageListener
//! ```

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// User property carrying the correlation (ordering) key
pub const PROPERTY_ORDER_ID: &str = "orderId";

// ============================================================
// OUTBOUND (Producer → Broker)
// ============================================================

/// How the broker should treat a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Visible to subscribers immediately
    Normal,
    /// Half message, hidden until a COMMIT decision arrives
    Prepare,
}

/// Message handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub tag: String,
    /// Business keys (the record number for transfer events)
    pub keys: String,
    /// User properties, e.g. `orderId`
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(
        topic: impl Into<String>,
        tag: impl Into<String>,
        keys: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            tag: tag.into(),
            keys: keys.into(),
            properties: BTreeMap::new(),
            body,
        }
    }

    /// Attach a user property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Broker acknowledgement of a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Broker-assigned message id
    pub msg_id: String,
    pub topic: String,
}

// ============================================================
// HALF MESSAGE (Broker → check-back)
// ============================================================

/// A prepared message whose outcome is still open
#[derive(Debug, Clone)]
pub struct HalfMessage {
    pub msg_id: String,
    pub message: OutboundMessage,
    /// When the broker accepted the prepare
    pub born_at: DateTime<Utc>,
    /// How many times the broker already asked for the outcome
    pub check_times: u32,
}

// ============================================================
// DELIVERED (Broker → Consumer)
// ============================================================

/// Message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub msg_id: String,
    pub topic: String,
    pub tag: String,
    pub keys: String,
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Number of earlier deliveries answered with reconsume-later
    pub reconsume_times: u32,
    pub born_at: DateTime<Utc>,
}

impl DeliveredMessage {
    /// Build the delivered form of a message the broker accepted
    pub fn from_outbound(msg_id: impl Into<String>, message: OutboundMessage) -> Self {
        Self {
            msg_id: msg_id.into(),
            topic: message.topic,
            tag: message.tag,
            keys: message.keys,
            properties: message.properties,
            body: message.body,
            reconsume_times: 0,
            born_at: Utc::now(),
        }
    }

    /// Look up a user property
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Body as text, for logs
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_survive_delivery() {
        let outbound = OutboundMessage::new("Topic", "*", "R-1", b"{}".to_vec())
            .with_property(PROPERTY_ORDER_ID, "order7");
        let delivered = DeliveredMessage::from_outbound("M-1", outbound);

        assert_eq!(delivered.msg_id, "M-1");
        assert_eq!(delivered.keys, "R-1");
        assert_eq!(delivered.property(PROPERTY_ORDER_ID), Some("order7"));
        assert_eq!(delivered.property("missing"), None);
        assert_eq!(delivered.reconsume_times, 0);
    }
}
