//! Transaction Error Types
//!
//! Errors on the publish side. An UNKNOWN outcome is not an error and never
//! shows up here: it is a regular `TransactionState` resolved by check-back.

use thiserror::Error;

use super::state::TransactionState;

/// Failures reported by the message transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected by broker: {0}")]
    Rejected(String),

    #[error("Unknown half message: {0}")]
    UnknownMessage(String),

    #[error("Transaction already decided as {0}")]
    AlreadyDecided(TransactionState),
}

impl TransportError {
    /// Get the error code for logs
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Unavailable(_) => "TRANSPORT_UNAVAILABLE",
            TransportError::Rejected(_) => "TRANSPORT_REJECTED",
            TransportError::UnknownMessage(_) => "UNKNOWN_MESSAGE",
            TransportError::AlreadyDecided(_) => "ALREADY_DECIDED",
        }
    }

    /// Whether the caller may reasonably try the same call again later
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Payload encoding / decoding failure
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure of `publish_transactional`
///
/// Only the prepare step can fail the call. Once the half message is
/// accepted the outcome is always a `TransactionState`.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Prepare failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Event encoding failed: {0}")]
    Encode(#[from] CodecError),
}

impl PublishError {
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Transport(e) => e.code(),
            PublishError::Encode(_) => "ENCODE_FAILED",
        }
    }
}
