//! Error types for the SFU

use thiserror::Error;

/// SFU error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Missing stream metadata: {0}")]
    MissingMetadata(&'static str),

    #[error("Invalid stream metadata: {0}")]
    InvalidMetadata(String),

    #[error("Room closed: {0}")]
    RoomClosed(String),

    #[error("Already closed: {0}")]
    Closed(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Task(String),
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, Error>;
