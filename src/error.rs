//! Error types for the gatekeeper.

use thiserror::Error;

/// Main error type for store and lifecycle operations.
///
/// Transport failures are not part of it: the sweep and the dispatcher
/// handle them where they happen.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payment: {0}")]
    InvalidPayment(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dispatcher is shut down")]
    Closed,
}

/// Failure of an outbound call to the chat transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The recipient can never be reached (blocked the bot, deleted account).
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    /// The call did not finish within the configured timeout.
    #[error("transport call timed out")]
    Timeout,

    /// Any other failure; worth retrying later.
    #[error("transport failure: {0}")]
    Failed(String),
}

impl TransportError {
    /// True when retrying the same call can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

impl From<rmp_serde::encode::Error> for GateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        GateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for GateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        GateError::Deserialization(e.to_string())
    }
}

/// Result type for gatekeeper operations.
pub type Result<T> = std::result::Result<T, GateError>;
