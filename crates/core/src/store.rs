//! Session persistence collaborator.
//!
//! The pipeline updates the chat session at the end of every run (user
//! message plus, when a narrative exists, the assistant turn with its image
//! and audio references). Where sessions actually live — files, a database —
//! is outside this system; the trait is append/overwrite only.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::message::{ChatSession, SessionId};

/// Append/overwrite-only persistence for chat sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist the session, replacing any prior version.
    async fn save(&self, session: &ChatSession) -> Result<()>;

    /// Load a session by id.
    async fn load(&self, id: &SessionId) -> Result<Option<ChatSession>>;
}

/// In-memory session store for tests and embedded use.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, ChatSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &ChatSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.0.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<ChatSession>> {
        Ok(self.sessions.read().await.get(&id.0).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let store = MemorySessionStore::new();
        let mut session = ChatSession::new();
        session.push(Message::user("hello"));

        store.save(&session).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn save_overwrites() {
        let store = MemorySessionStore::new();
        let mut session = ChatSession::new();
        store.save(&session).await.unwrap();

        session.push(Message::user("updated"));
        store.save(&session).await.unwrap();

        assert_eq!(store.len().await, 1);
        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = MemorySessionStore::new();
        let missing = store.load(&SessionId::from("nope")).await.unwrap();
        assert!(missing.is_none());
    }
}
