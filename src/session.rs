//! Session registry: session id → (client transport, agent transport).
//!
//! Both transports of a session live in one map entry, so a lookup returns a
//! complete pair or nothing.  The lock is never held across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::transport::Transport;
use crate::{AppError, Result};

/// An active session: the browser-facing and agent-facing transports.
#[derive(Clone)]
pub struct Session {
    /// Opaque unique identifier.
    pub id: String,
    /// Transport facing the browser client.
    pub client: Arc<dyn Transport>,
    /// Transport facing the backing agent.
    pub agent: Arc<dyn Transport>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client.kind())
            .field("agent", &self.agent.kind())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Process-wide table of active sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a complete pair under `id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if `id` is already registered.
    pub fn register(
        &self,
        id: &str,
        client: Arc<dyn Transport>,
        agent: Arc<dyn Transport>,
    ) -> Result<Session> {
        let mut guard = self.lock();
        if guard.contains_key(id) {
            return Err(AppError::Conflict(format!("session {id} already registered")));
        }
        let session = Session {
            id: id.to_owned(),
            client,
            agent,
            created_at: Utc::now(),
        };
        guard.insert(id.to_owned(), session.clone());
        debug!(session_id = id, active = guard.len(), "session registered");
        Ok(session)
    }

    /// The full pair for `id`, if registered.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    /// The client-facing transport for `id`.
    #[must_use]
    pub fn client(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.lock().get(id).map(|s| Arc::clone(&s.client))
    }

    /// The agent-facing transport for `id`.
    #[must_use]
    pub fn agent(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.lock().get(id).map(|s| Arc::clone(&s.agent))
    }

    /// Remove both entries for `id`.  Returns the removed pair, if any.
    pub fn unregister(&self, id: &str) -> Option<Session> {
        let mut guard = self.lock();
        let removed = guard.remove(id);
        if removed.is_some() {
            debug!(session_id = id, active = guard.len(), "session unregistered");
        }
        removed
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of active session ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Remove and return every session, e.g. on shutdown.
    pub fn drain(&self) -> Vec<Session> {
        self.lock().drain().map(|(_, s)| s).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
