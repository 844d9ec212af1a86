//! Live sessions of one world.

use super::client::{Session, SessionId};
use crate::error::WorldError;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::info;

/// Tracks live sessions and which account each one is logged in as.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next_id: u64,
    sessions: HashMap<SessionId, Session>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            sessions: HashMap::new(),
        }
    }

    /// Add a session, returning its fresh id.
    pub fn register(&mut self, addr: SocketAddr) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id, Session::new(id, addr));
        info!("Session {} connected from {}", id, addr);
        id
    }

    pub fn lookup(&self, id: SessionId) -> Result<&Session, WorldError> {
        self.sessions.get(&id).ok_or(WorldError::SessionNotFound)
    }

    pub fn lookup_mut(&mut self, id: SessionId) -> Result<&mut Session, WorldError> {
        self.sessions.get_mut(&id).ok_or(WorldError::SessionNotFound)
    }

    /// Remove a session. Disconnect is terminal: the id is never reused.
    pub fn unregister(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        info!(
            "Session {} ({}) disconnected after {:?}",
            id,
            session.addr,
            session.connected_at.elapsed()
        );
        Some(session)
    }

    /// Attach an account to a session.
    pub fn attach_identity(&mut self, id: SessionId, key: String) -> Result<(), WorldError> {
        self.lookup_mut(id)?.identity = Some(key);
        Ok(())
    }

    pub fn identity_of(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(&id).and_then(|s| s.identity.as_deref())
    }

    /// Every session logged in as `key`, in id order.
    pub fn sessions_of(&self, key: &str) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.identity.as_deref() == Some(key))
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    /// Distinct accounts with at least one live session.
    pub fn online_identities(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sessions
            .values()
            .filter_map(|s| s.identity.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
