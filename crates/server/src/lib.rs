//! Authoritative state server for the shared house and pixel canvas worlds.

pub mod config;
pub mod error;
pub mod governor;
pub mod identity;
pub mod persist;
pub mod server;
pub mod world;

// Re-export commonly used types
pub use config::{Config, WorldKind};
pub use error::{ErrorKind, WorldError};
pub use server::{GameState, SessionId, run, serve_with_shutdown};
