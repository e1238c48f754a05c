//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Commit or record decoding error.
    #[error("Decode error: {0}")]
    Decode(#[from] skyfeed_core::Error),

    /// A frame could not be interpreted as a stream message.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Websocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport failure other than a websocket protocol error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The upstream closed the stream.
    #[error("Stream closed by upstream")]
    StreamClosed,

    /// The upstream sent an error frame.
    #[error("Upstream error {error}: {message}")]
    UpstreamError {
        /// Error name, e.g. `FutureCursor`.
        error: String,
        /// Human-readable description.
        message: String,
    },

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event handler failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A query parameter value of an unsupported type.
    #[error("Invalid query parameter '{0}'")]
    InvalidParam(String),

    /// A manual override line that is not a post URL.
    #[error("Invalid post URL: {0}")]
    InvalidPostUrl(String),
}

impl Error {
    /// Whether this error ends the current stream session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_)
                | Error::Transport(_)
                | Error::StreamClosed
                | Error::UpstreamError { .. }
        )
    }
}
