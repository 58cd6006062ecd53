//! Session correlation for stateful message handling
//!
//! Associates an inbound message with prior application state through a
//! `session_id` carried in the message headers. State storage itself lives
//! behind the [`SessionStore`] seam — an external collaborator such as a
//! cache or database; [`InMemorySessionStore`] covers tests and
//! single-process services.

use crate::error::SessionError;
use crate::message::MessageProperties;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// State associated with one session key.
pub type SessionState = HashMap<String, Value>;

/// External store for per-session state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// State for `key`; an empty map when the session is unknown.
    async fn retrieve(&self, key: &str) -> Result<SessionState, SessionError>;

    /// Replace the state for `key`.
    async fn update(&self, key: &str, state: SessionState) -> Result<(), SessionError>;
}

/// Dashmap-backed store for tests and single-process services.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn retrieve(&self, key: &str) -> Result<SessionState, SessionError> {
        Ok(self
            .sessions
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn update(&self, key: &str, state: SessionState) -> Result<(), SessionError> {
        self.sessions.insert(key.to_string(), state);
        Ok(())
    }
}

/// Extract the session key from message metadata.
///
/// Returns `None` when headers are absent, the `session_id` key is absent,
/// or its value is null/empty — all normal "no session" cases, never errors.
/// String and numeric values are coerced to a string.
pub fn extract_session_id(properties: &MessageProperties) -> Option<String> {
    let headers = match &properties.headers {
        Some(headers) => headers,
        None => {
            tracing::warn!("Message properties missing headers for session correlation");
            return None;
        }
    };

    let value = match headers.get("session_id") {
        Some(value) => value,
        None => {
            tracing::warn!("Message headers missing session_id");
            return None;
        }
    };

    let session_id = match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(false) => None,
        Value::Bool(true) => Some("true".to_string()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    };

    if session_id.is_none() {
        tracing::warn!("Message session_id header is empty");
    }
    session_id
}

/// Resolves session keys from deliveries and delegates state access to the
/// configured [`SessionStore`].
pub struct SessionCorrelator {
    store: Arc<dyn SessionStore>,
}

impl SessionCorrelator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Resolve the session key from `properties` and load its state.
    ///
    /// `Ok(None)` is the normal "no session" result; store failures are the
    /// only errors.
    pub async fn state_for(
        &self,
        properties: &MessageProperties,
    ) -> Result<Option<(String, SessionState)>, SessionError> {
        match extract_session_id(properties) {
            Some(key) => {
                let state = self.store.retrieve(&key).await?;
                Ok(Some((key, state)))
            }
            None => Ok(None),
        }
    }

    /// Persist updated state for a resolved session key.
    pub async fn save(&self, key: &str, state: SessionState) -> Result<(), SessionError> {
        self.store.update(key, state).await
    }
}
