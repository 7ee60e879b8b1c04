//! Error type shared by every stage of the voice pipeline.

use crate::live::SessionState;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for live voice session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Microphone or speaker could not be acquired
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The duplex channel failed to open or dropped
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    /// An inbound payload could not be turned into PCM
    #[error("Decode error: {0}")]
    Decode(String),

    /// An outbound frame was dropped by the backpressure policy
    #[error("Outbound frame dropped")]
    SendDropped,

    #[error("Session closed")]
    SessionClosed,

    #[error("Operation cancelled by stop")]
    Cancelled,

    #[error("Invalid transition {trigger:?} from state {from:?}")]
    InvalidTransition {
        from: SessionState,
        trigger: &'static str,
    },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording error: {0}")]
    Recording(#[from] hound::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LiveError {
    /// Whether this error ends the session it happened in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::DeviceUnavailable(_)
                | LiveError::Connection(_)
                | LiveError::WebSocket(_)
                | LiveError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
