//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while decoding or encoding events.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: &'static str, reason: String },

    #[error("Invalid color: {0}")]
    InvalidColor(String),
}
