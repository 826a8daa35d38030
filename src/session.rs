//! Per-guest session storage keyed by an opaque ULID token.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

pub type SessionToken = Ulid;

/// Session key holding the logged-in staff user's id.
pub const USER_ID_KEY: &str = "user_id";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session value {key} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("session value could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve a client-supplied token, starting a fresh session when it is
    /// absent or unknown.
    async fn load_or_create(&self, token: Option<SessionToken>) -> Result<SessionToken, SessionError>;
    async fn get(&self, token: SessionToken, key: &str) -> Result<Option<Value>, SessionError>;
    async fn put(&self, token: SessionToken, key: &str, value: Value) -> Result<(), SessionError>;
    /// Remove and return a value.
    async fn remove(&self, token: SessionToken, key: &str) -> Result<Option<Value>, SessionError>;
    async fn destroy(&self, token: SessionToken) -> Result<(), SessionError>;
    /// Move the session's data under a new token; the old token stops working.
    async fn renew_token(&self, token: SessionToken) -> Result<SessionToken, SessionError>;
}

pub async fn get_as<T: DeserializeOwned>(
    sessions: &dyn SessionStore,
    token: SessionToken,
    key: &str,
) -> Result<Option<T>, SessionError> {
    match sessions.get(token, key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| SessionError::Decode {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub async fn put_as<T: Serialize>(
    sessions: &dyn SessionStore,
    token: SessionToken,
    key: &str,
    value: &T,
) -> Result<(), SessionError> {
    sessions.put(token, key, serde_json::to_value(value)?).await
}

// ── Flash messages ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashKind {
    Flash,
    Warning,
    Error,
}

impl FlashKind {
    pub fn key(self) -> &'static str {
        match self {
            FlashKind::Flash => "flash",
            FlashKind::Warning => "warning",
            FlashKind::Error => "error",
        }
    }
}

/// One-shot notices popped on the next response that renders them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Flashes {
    pub fn is_empty(&self) -> bool {
        self.flash.is_none() && self.warning.is_none() && self.error.is_none()
    }
}

pub async fn set_flash(
    sessions: &dyn SessionStore,
    token: SessionToken,
    kind: FlashKind,
    message: &str,
) -> Result<(), SessionError> {
    sessions
        .put(token, kind.key(), Value::String(message.to_string()))
        .await
}

pub async fn pop_flashes(
    sessions: &dyn SessionStore,
    token: SessionToken,
) -> Result<Flashes, SessionError> {
    async fn pop(
        sessions: &dyn SessionStore,
        token: SessionToken,
        kind: FlashKind,
    ) -> Result<Option<String>, SessionError> {
        Ok(sessions
            .remove(token, kind.key())
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }
    Ok(Flashes {
        flash: pop(sessions, token, FlashKind::Flash).await?,
        warning: pop(sessions, token, FlashKind::Warning).await?,
        error: pop(sessions, token, FlashKind::Error).await?,
    })
}

// ── In-memory store ──────────────────────────────────────────

struct Entry {
    values: HashMap<String, Value>,
    touched: Instant,
}

impl Entry {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            touched: Instant::now(),
        }
    }
}

/// Sessions held in process memory, expiring after `ttl` without use.
pub struct MemorySessionStore {
    sessions: DashMap<SessionToken, Entry>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle since before `now - ttl`. Returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| now.saturating_duration_since(entry.touched) < self.ttl);
        before.saturating_sub(self.sessions.len())
    }

    fn live(&self, token: SessionToken) -> Option<dashmap::mapref::one::RefMut<'_, SessionToken, Entry>> {
        let mut entry = self.sessions.get_mut(&token)?;
        if entry.touched.elapsed() >= self.ttl {
            drop(entry);
            self.sessions.remove(&token);
            return None;
        }
        entry.touched = Instant::now();
        Some(entry)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_or_create(&self, token: Option<SessionToken>) -> Result<SessionToken, SessionError> {
        if let Some(token) = token
            && self.live(token).is_some()
        {
            return Ok(token);
        }
        let token = Ulid::new();
        self.sessions.insert(token, Entry::new());
        Ok(token)
    }

    async fn get(&self, token: SessionToken, key: &str) -> Result<Option<Value>, SessionError> {
        Ok(self.live(token).and_then(|e| e.values.get(key).cloned()))
    }

    async fn put(&self, token: SessionToken, key: &str, value: Value) -> Result<(), SessionError> {
        match self.live(token) {
            Some(mut entry) => {
                entry.values.insert(key.to_string(), value);
            }
            None => {
                let mut entry = Entry::new();
                entry.values.insert(key.to_string(), value);
                self.sessions.insert(token, entry);
            }
        }
        Ok(())
    }

    async fn remove(&self, token: SessionToken, key: &str) -> Result<Option<Value>, SessionError> {
        Ok(self.live(token).and_then(|mut e| e.values.remove(key)))
    }

    async fn destroy(&self, token: SessionToken) -> Result<(), SessionError> {
        self.sessions.remove(&token);
        Ok(())
    }

    async fn renew_token(&self, token: SessionToken) -> Result<SessionToken, SessionError> {
        let mut entry = self
            .sessions
            .remove(&token)
            .map(|(_, e)| e)
            .unwrap_or_else(Entry::new);
        entry.touched = Instant::now();
        let renewed = Ulid::new();
        self.sessions.insert(renewed, entry);
        Ok(renewed)
    }
}
