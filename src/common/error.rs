//! Error types for the remote runner
//!
//! Protocol misuse surfaces as an explicit error to the immediate caller.
//! Transport failures are logged by the connection manager and never reach
//! this type unless a caller asked for something synchronously.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::CloseInfo;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the remote runner
#[derive(Error, Debug)]
pub enum Error {
    // === Connection Errors ===
    #[error("Already connected. Call disconnect() before connecting again")]
    AlreadyConnected,

    #[error("Cannot send, connection closed")]
    NotConnected,

    #[error("Invalid session identity '{0}': not usable as a WebSocket sub-protocol")]
    InvalidIdentity(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    // === Run Errors ===
    #[error("Test framework is instrumented; runs must be requested by the controller")]
    Instrumented,

    #[error("A run is already in progress (run {0})")]
    RunInProgress(u64),

    #[error("Run failed: {0}")]
    RunFailed(String),

    // === Codec Errors ===
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unknown event name '{0}'")]
    UnknownEvent(String),

    // === Controller Errors ===
    #[error("Failed to bind controller on {addr}: {error}")]
    Bind { addr: String, error: io::Error },

    #[error("No endpoint connected with identity '{0}'")]
    SessionNotFound(String),

    #[error("Connection to endpoint lost ({0})")]
    ConnectionLost(CloseInfo),

    #[error("Controller has shut down")]
    ControllerClosed,

    // === Timeout Errors ===
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Create a bind error for the given address
    pub fn bind(addr: impl ToString, error: io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            error,
        }
    }
}
