//! Client session state.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Server-assigned id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected client session.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID.
    pub id: SessionId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Account key once logged in (canvas worlds).
    pub identity: Option<String>,
    pub connected_at: Instant,
    /// A register or login of this session is being hashed.
    pub credential_pending: bool,
}

impl Session {
    /// Create a new client session.
    pub fn new(id: SessionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            identity: None,
            connected_at: Instant::now(),
            credential_pending: false,
        }
    }
}
