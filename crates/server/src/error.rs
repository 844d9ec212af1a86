//! Errors surfaced to clients.

use thiserror::Error;

/// Broad class of a [`WorldError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input, rejected before any mutation.
    Validation,
    /// Bad credentials, duplicate username, unauthenticated action.
    Auth,
    /// Out of credits or cooling down.
    ResourceExhausted,
    /// Unknown room, user or session.
    NotFound,
    /// Server-side fault.
    Internal,
}

/// Rejection of a client request. Never terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Unknown room: {0}")]
    UnknownRoom(String),

    #[error("Pixel ({x}, {y}) is outside the canvas")]
    OutOfBounds { x: i64, y: i64 },

    #[error("You have no pixel credits left")]
    InsufficientCredits,

    #[error("Please log in before painting")]
    NotAuthenticated,

    #[error("That username is already taken")]
    UsernameTaken,

    #[error("No account with that username")]
    UnknownUser,

    #[error("Wrong password")]
    BadCredential,

    #[error("Join the house first")]
    NotJoined,

    #[error("Slow down! Try again in {remaining_ms} ms")]
    Cooldown { remaining_ms: u64 },

    #[error("{0} is not available in this world")]
    Unsupported(&'static str),

    #[error("Still checking your last request, please wait")]
    CredentialBusy,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Something went wrong, please try again")]
    Internal,
}

impl WorldError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorldError::InvalidInput(_)
            | WorldError::OutOfBounds { .. }
            | WorldError::Unsupported(_) => ErrorKind::Validation,
            WorldError::UsernameTaken | WorldError::BadCredential | WorldError::NotAuthenticated => {
                ErrorKind::Auth
            }
            WorldError::InsufficientCredits
            | WorldError::Cooldown { .. }
            | WorldError::CredentialBusy => ErrorKind::ResourceExhausted,
            WorldError::UnknownRoom(_)
            | WorldError::UnknownUser
            | WorldError::NotJoined
            | WorldError::SessionNotFound => ErrorKind::NotFound,
            WorldError::Internal => ErrorKind::Internal,
        }
    }
}
