//! In-memory per-identity session store.
//!
//! Sessions are created on first contact, refreshed on every message, and
//! removed only by [`SessionStore::sweep_idle`]. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;


fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Interaction state tracked for one remote identity.
pub struct Session {
    pub message_count: u64,
    pub last_activity_unix_ms: u64,
    pub command_invocations: HashMap<String, u64>,
}

impl Session {
    fn new(now_unix_ms: u64) -> Self {
        Self {
            message_count: 0,
            last_activity_unix_ms: now_unix_ms,
            command_invocations: HashMap::new(),
        }
    }

    pub fn last_invocation(&self, command: &str) -> Option<u64> {
        self.command_invocations.get(command).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Aggregate counters reported in health snapshots.
pub struct SessionStoreStats {
    pub sessions: usize,
    pub total_messages: u64,
    pub cooldown_stamps: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Outcome of [`SessionStore::compact`].
pub struct CompactionReport {
    pub expired_cooldowns: usize,
    pub sessions_retained: usize,
}

#[derive(Debug, Default)]
/// Owns every [`Session`]. Shared behind an `Arc` by the dispatcher and the sweep task.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the session on first contact, then counts the message and refreshes
    /// last activity. Returns the identity's message count after this message.
    pub fn record_activity(&self, identity: &str, now_unix_ms: u64) -> u64 {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(identity.to_string())
            .or_insert_with(|| Session::new(now_unix_ms));
        session.message_count = session.message_count.saturating_add(1);
        session.last_activity_unix_ms = now_unix_ms;
        session.message_count
    }

    /// Stamps the cooldown timestamp for `command`. Last write wins.
    pub fn record_invocation(&self, identity: &str, command: &str, now_unix_ms: u64) {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(identity.to_string())
            .or_insert_with(|| Session::new(now_unix_ms));
        session
            .command_invocations
            .insert(command.to_string(), now_unix_ms);
    }

    pub fn last_invocation(&self, identity: &str, command: &str) -> Option<u64> {
        self.sessions()
            .get(identity)
            .and_then(|session| session.last_invocation(command))
    }

    pub fn session(&self, identity: &str) -> Option<Session> {
        self.sessions().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn stats(&self) -> SessionStoreStats {
        let sessions = self.sessions();
        SessionStoreStats {
            sessions: sessions.len(),
            total_messages: sessions
                .values()
                .fold(0u64, |total, session| total.saturating_add(session.message_count)),
            cooldown_stamps: sessions
                .values()
                .map(|session| session.command_invocations.len())
                .sum(),
        }
    }

    /// Removes every session whose last activity is older than `now - max_idle`.
    /// A session active exactly at the cutoff is kept.
    pub fn sweep_idle(&self, max_idle: Duration, now_unix_ms: u64) -> usize {
        let cutoff = now_unix_ms.saturating_sub(duration_ms(max_idle));
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity_unix_ms >= cutoff);
        let removed = before - sessions.len();
        debug!(
            removed,
            remaining = sessions.len(),
            cutoff_unix_ms = cutoff,
            "session sweep completed"
        );
        removed
    }

    /// Drops cooldown stamps that can no longer block anything and releases
    /// spare map capacity. Sessions themselves are left to the idle sweep.
    pub fn compact(&self, cooldown_window: Duration, now_unix_ms: u64) -> CompactionReport {
        let window_ms = duration_ms(cooldown_window);
        let mut sessions = self.sessions();
        let mut expired_cooldowns = 0usize;
        for session in sessions.values_mut() {
            let before = session.command_invocations.len();
            session
                .command_invocations
                .retain(|_, stamp| now_unix_ms.saturating_sub(*stamp) < window_ms);
            expired_cooldowns += before - session.command_invocations.len();
            session.command_invocations.shrink_to_fit();
        }
        sessions.shrink_to_fit();
        CompactionReport {
            expired_cooldowns,
            sessions_retained: sessions.len(),
        }
    }
}
