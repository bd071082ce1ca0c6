//! Error types for the Lantern gateway

use thiserror::Error;

/// Result type alias for Lantern operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Lantern gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device protocol error (malformed or out-of-order control message)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Session not found or no longer valid
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Session limit reached
    #[error("session limit reached ({0} active)")]
    SessionLimit(usize),

    /// Audio codec error
    #[error("codec error: {0}")]
    Codec(String),

    /// Speech recognition error
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Recognition backend reported a protocol-level error code
    #[error("recognition backend error {code}: {message}")]
    Backend {
        /// Signed error code from the backend envelope
        code: i32,
        /// Backend-supplied error text, if any
        message: String,
    },

    /// Language-model collaborator error
    #[error("chat error: {0}")]
    Chat(String),

    /// Speech-synthesis collaborator error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error on a backend connection
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
