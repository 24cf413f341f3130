//! Error types for the realtime voice engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the realtime voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, invalid endpoint)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error (capture or playback unavailable)
    #[error("audio error: {0}")]
    Audio(String),

    /// Sample rate conversion error
    #[error("resample error: {0}")]
    Resample(String),

    /// Transport error (connection lost, socket closed)
    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound send failed; the session stays up
    #[error("send error: {0}")]
    Send(String),

    /// Inbound message could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Base64 payload error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}
