//! Error type shared by the voice session components

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for realtime voice operations
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
