//! Registry of active rehearsal sessions.
//!
//! Removal is the single point of termination: whoever removes a session
//! owns its teardown, so concurrent `stop`, disconnect, reaper and
//! completion paths resolve to exactly one winner.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::session::Session;
use super::{ConnectionId, SessionId};

pub type SessionHandle = Arc<Mutex<Session>>;

struct Entry {
    owner: ConnectionId,
    handle: SessionHandle,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Entry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created session.
    pub fn create(&self, session: Session) -> SessionHandle {
        let id = session.id.clone();
        let owner = session.owner;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(
            id,
            Entry {
                owner,
                handle: handle.clone(),
            },
        );
        handle
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|e| e.handle.clone())
    }

    /// Remove a session. Returns `None` if it was already gone.
    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, e)| e.handle)
    }

    /// Ids of every session owned by `owner`.
    pub fn owned_by(&self, owner: ConnectionId) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|e| e.owner == owner)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of all sessions for sweeping.
    pub fn snapshot(&self) -> Vec<(SessionId, SessionHandle)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
