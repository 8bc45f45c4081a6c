//! Error types for the chat stream client.

use thiserror::Error;

/// Failure of a connection attempt or of one exchange.
///
/// `Clone` so that one transport failure can be delivered to every exchange it affects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Transport could not open or authenticate.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A frame was written while no connection was open.
    #[error("not connected")]
    NotConnected,

    /// The server reported an error for this exchange.
    #[error("stream failed: {0}")]
    StreamFailed(String),

    /// The connection dropped while the exchange was pending.
    #[error("disconnected")]
    Disconnected,

    /// No terminal frame arrived in time.
    #[error("timed out waiting for a response")]
    Timeout,

    /// Prompt rejected before it was sent.
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    /// The credential source could not supply a token.
    #[error("credential unavailable: {0}")]
    Credential(String),

    /// The client's event loop is no longer running.
    #[error("client has shut down")]
    Shutdown,

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Json(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::ConnectionFailed(e.to_string())
    }
}

/// Config load/save/validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
