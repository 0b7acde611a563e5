//! The `error` module defines the error types used across `smsgate`.
//!
//! Each layer gets its own enum so callers can tell a store failure from a
//! link failure without string matching:
//!
//! - [`StoreError`]: durable store failures (sled, serialization, duplicates).
//! - [`DeviceError`]: modem open / handshake / send failures.
//! - [`SubmitError`]: what a producer sees when a submission is refused.
//! - [`ClientError`]: failures of the WebSocket client used by the CLI.

use std::io;

use thiserror::Error;

/// Failures of the durable message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A message with this identity has already been inserted.
    #[error("message {0} already exists")]
    Duplicate(String),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure, mostly useful for alternative stores.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by a device link.
///
/// `Closed` is special: it means the physical link is gone and the message
/// that was being sent is not at fault.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("link closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device answered, but with an error result code.
    #[error("device error: {0}")]
    Protocol(String),
}

/// Reasons a submission can be refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The dispatcher is no longer running.
    #[error("dispatcher stopped")]
    Stopped,
}

/// Failures of [`crate::client::GatewayClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("connection closed before a response arrived")]
    Disconnected,

    #[error("unexpected response type")]
    UnexpectedResponse,
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(err: sled::transaction::TransactionError<StoreError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(err) => err,
            sled::transaction::TransactionError::Storage(err) => StoreError::Sled(err),
        }
    }
}
