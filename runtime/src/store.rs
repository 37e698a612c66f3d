//! Session Store - Persisted-State Seam
//!
//! Sessions are exclusively owned: one handle per session, shared
//! between the lifecycle engine, the job runner's writeback, and any
//! aggregation reader. The `persist` hook is the transaction boundary -
//! the engine calls it, with the lock held, at every point where state
//! must be durable before control returns to the client.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use trellis_core::Session;
use uuid::Uuid;

pub type SessionHandle = Arc<Mutex<Session>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub trait SessionStore: Send + Sync + 'static {
    /// Create and register a fresh session.
    fn create(&self) -> SessionHandle;

    fn get(&self, id: Uuid) -> Option<SessionHandle>;

    /// Make the current state durable. Called with the session lock
    /// held so the written snapshot is consistent.
    fn persist(&self, session: &Session) -> Result<(), StoreError>;
}

/// In-process store. The handles themselves are the storage, so
/// `persist` has nothing left to do.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn create(&self) -> SessionHandle {
        let session = Session::new();
        let id = session.id;
        let handle: SessionHandle = Arc::new(Mutex::new(session));
        self.sessions.write().insert(id, handle.clone());
        tracing::debug!(session = %id, "created session");
        handle
    }

    fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.read().get(&id).cloned()
    }

    fn persist(&self, _session: &Session) -> Result<(), StoreError> {
        Ok(())
    }
}
