//! In-memory session key store.
//!
//! Each authenticated session owns exactly one [`SessionKey`]. Keys live only
//! in process memory, are handed to the exchange codec on every request, and
//! are destroyed on logout or after the configured idle timeout.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;
use vk_crypto::SessionKey;

/// Maximum accepted length of a session identifier.
const MAX_SESSION_ID_LENGTH: usize = 128;

/// Opaque identifier of an authenticated session.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Draw a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a session id supplied by the caller (e.g. the `X-Session-Id` header).
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidId`] if the id is empty, too long, or
    /// contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.len() > MAX_SESSION_ID_LENGTH
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SessionError::InvalidId);
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Session ids are bearer-ish; only show a prefix
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "SessionId({prefix}..)")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{prefix}")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no key issued for this session")]
    NotFound,
    #[error("invalid session id")]
    InvalidId,
    #[error("session store unavailable")]
    Unavailable,
}

struct Entry {
    key: SessionKey,
    issued_at: DateTime<Utc>,
    last_seen: Instant,
}

/// Session id to key map, shared across request handlers.
pub struct SessionKeyStore {
    entries: RwLock<HashMap<SessionId, Entry>>,
    idle_timeout: Duration,
}

impl SessionKeyStore {
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Return the session's key, creating it on first call.
    ///
    /// Concurrent calls for the same session observe the same key: the
    /// check-and-insert happens under a single write lock.
    ///
    /// # Errors
    /// Returns [`SessionError::Unavailable`] if the lock is poisoned.
    pub fn issue(&self, session: &SessionId) -> Result<SessionKey, SessionError> {
        let mut map = self.entries.write().map_err(|_| SessionError::Unavailable)?;
        let now = Instant::now();
        if map.get(session).is_some_and(|e| self.is_idle(e, now)) {
            map.remove(session);
            tracing::info!(session = %session, "replacing idle session key");
        }
        let entry = map.entry(session.clone()).or_insert_with(|| {
            tracing::info!(session = %session, "issued session key");
            Entry {
                key: SessionKey::generate(),
                issued_at: Utc::now(),
                last_seen: now,
            }
        });
        entry.last_seen = now;
        Ok(entry.key.clone())
    }

    /// Fetch the session's key and refresh its last-seen time.
    ///
    /// # Errors
    /// Returns [`SessionError::NotFound`] if no key was issued, it was
    /// revoked or purged, or it has been idle past the timeout.
    pub fn lookup(&self, session: &SessionId) -> Result<SessionKey, SessionError> {
        let mut map = self.entries.write().map_err(|_| SessionError::Unavailable)?;
        let now = Instant::now();
        let entry = map.get_mut(session).ok_or(SessionError::NotFound)?;
        if self.is_idle(entry, now) {
            map.remove(session);
            tracing::info!(session = %session, "session key expired");
            return Err(SessionError::NotFound);
        }
        entry.last_seen = now;
        Ok(entry.key.clone())
    }

    fn is_idle(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen) > self.idle_timeout
    }

    /// When the session's key was issued, if it exists.
    #[must_use]
    pub fn issued_at(&self, session: &SessionId) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .ok()
            .and_then(|map| map.get(session).map(|e| e.issued_at))
    }

    /// Invalidate the session's key. Returns whether a key existed.
    pub fn revoke(&self, session: &SessionId) -> bool {
        let Ok(mut map) = self.entries.write() else {
            return false;
        };
        let removed = map.remove(session).is_some();
        if removed {
            tracing::info!(session = %session, "revoked session key");
        }
        removed
    }

    /// Destroy keys not used within the idle timeout. Returns how many were dropped.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let Ok(mut map) = self.entries.write() else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, e| !self.is_idle(e, now));
        before - map.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |map| map.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
