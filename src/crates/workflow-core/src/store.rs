//! Pluggable persistence contracts for memory and session state.
//!
//! The storage drivers themselves are external collaborators; this
//! module only defines the traits the engine depends on, plus a simple
//! in-process implementation of each for tests and for callers that don't
//! need cross-process persistence.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Process-lifetime key/value store. Responsible for its own internal
/// locking.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value);
}

/// TTL-bounded key/value store, keyed by session id (default TTL 30
/// minutes, file- or memory-backed). `touch` refreshes a session's
/// expiration on access; `purge_expired` lets an embedder schedule sweeps.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Option<Value>;
    async fn set(&self, session_id: &str, key: &str, value: Value);
    async fn snapshot(&self, session_id: &str) -> HashMap<String, Value>;
    async fn touch(&self, session_id: &str);
    async fn purge_expired(&self);
}

/// Default session TTL.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// In-process [`MemoryStore`], backed by a `parking_lot::RwLock<HashMap>`.
#[derive(Default)]
pub struct InMemoryStore {
    data: parking_lot::RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
    }
}

struct SessionEntry {
    data: HashMap<String, Value>,
    expires_at: Instant,
}

/// In-process [`SessionStore`] respecting a fixed TTL, refreshed on every
/// `touch`/`set`/`get`. A production embedder typically backs this with a
/// file at `<home>/.kdeps/sessions.db` instead; that driver lives outside
/// this crate.
pub struct InMemorySessionStore {
    ttl: Duration,
    sessions: parking_lot::RwLock<HashMap<String, SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn is_expired(entry: &SessionEntry) -> bool {
        Instant::now() >= entry.expires_at
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Option<Value> {
        let sessions = self.sessions.read();
        let entry = sessions.get(session_id)?;
        if Self::is_expired(entry) {
            return None;
        }
        entry.data.get(key).cloned()
    }

    async fn set(&self, session_id: &str, key: &str, value: Value) {
        let mut sessions = self.sessions.write();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(|| SessionEntry {
            data: HashMap::new(),
            expires_at: Instant::now() + self.ttl,
        });
        entry.data.insert(key.to_string(), value);
        entry.expires_at = Instant::now() + self.ttl;
    }

    async fn snapshot(&self, session_id: &str) -> HashMap<String, Value> {
        let sessions = self.sessions.read();
        match sessions.get(session_id) {
            Some(entry) if !Self::is_expired(entry) => entry.data.clone(),
            _ => HashMap::new(),
        }
    }

    async fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.expires_at = Instant::now() + self.ttl;
        }
    }

    async fn purge_expired(&self) {
        let mut sessions = self.sessions.write();
        sessions.retain(|_, entry| !Self::is_expired(entry));
    }
}
