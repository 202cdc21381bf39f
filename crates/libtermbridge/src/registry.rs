//! In-memory store of live sessions. A session is present here exactly
//! while its child process is running; the reaper path removes it.

use crate::error::{BridgeError, Result};
use crate::pty::SessionIo;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use termbridge_protocol::SessionId;

/// One running terminal session.
pub struct Session {
    pub id: SessionId,
    pub pid: u32,
    /// The command string as requested, unresolved. Display only.
    pub process_name: String,
    pub workdir: String,
    pub started_at: DateTime<Utc>,
    /// Owned exclusively by this session; all access goes through the
    /// manager's verbs.
    pub io: Arc<SessionIo>,
}

#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .expect("registry lock poisoned")
            .insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }

    /// Idempotent; removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) {
        self.sessions
            .write()
            .expect("registry lock poisoned")
            .remove(id);
    }

    /// Point-in-time copy of all live sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .len()
    }
}
