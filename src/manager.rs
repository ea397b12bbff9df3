use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::chat::{
    derive_title, ChatSession, Message, SessionCollection, NEW_CHAT_GREETING, WELCOME_GREETING,
};
use crate::store::Store;

/// Owns the session collection and the current-session pointer for one
/// interaction. Every mutation is flushed to the store before returning.
///
/// The collection is never empty once a manager has been opened.
pub struct SessionManager {
    store: Store,
    sessions: SessionCollection,
    current: String,
}

impl SessionManager {
    /// Load the collection from `store` and resolve the current session.
    ///
    /// When `current` is absent or no longer exists, a welcome session is
    /// created, made current and persisted.
    pub async fn open(store: Store, current: Option<String>) -> Result<Self> {
        let sessions = store.load_sessions().await;
        let existing = current.filter(|id| sessions.contains(id));

        match existing {
            Some(current) => Ok(Self {
                store,
                sessions,
                current,
            }),
            None => {
                let session = ChatSession::new(WELCOME_GREETING);
                let mut manager = Self {
                    store,
                    current: session.id.clone(),
                    sessions,
                };
                manager.sessions.insert(session);
                manager.flush().await?;
                Ok(manager)
            }
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionCollection {
        &self.sessions
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    pub fn current(&self) -> Result<&ChatSession> {
        self.sessions
            .get(&self.current)
            .ok_or_else(|| anyhow!("Current chat session {} is missing", self.current))
    }

    pub async fn new_session(&mut self) -> Result<&ChatSession> {
        let session = ChatSession::new(NEW_CHAT_GREETING);
        info!("Created chat session {}", session.id);
        self.current = session.id.clone();
        self.sessions.insert(session);
        self.flush().await?;
        self.current()
    }

    /// Make an existing session current.
    pub fn select(&mut self, id: &str) -> Result<&ChatSession> {
        if !self.sessions.contains(id) {
            return Err(anyhow!("Unknown chat session: {}", id));
        }
        self.current = id.to_string();
        self.current()
    }

    pub async fn clear_current(&mut self) -> Result<()> {
        if let Some(session) = self.sessions.get_mut(&self.current) {
            session.messages.clear();
        }
        self.flush().await
    }

    /// Remove the current session. The first remaining session becomes
    /// current; if none remain a welcome session replaces it.
    pub async fn delete_current(&mut self) -> Result<()> {
        self.sessions.remove(&self.current);
        info!("Deleted chat session {}", self.current);

        match self.sessions.first() {
            Some(next) => self.current = next.id.clone(),
            None => {
                let session = ChatSession::new(WELCOME_GREETING);
                self.current = session.id.clone();
                self.sessions.insert(session);
            }
        }
        self.flush().await
    }

    /// Overwrite the current title. Any string is accepted.
    pub async fn rename_current(&mut self, title: &str) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&self.current) else {
            return Ok(());
        };
        if session.title == title {
            return Ok(());
        }
        session.title = title.to_string();
        self.flush().await
    }

    /// Append to a session's message list. The first user text in a session
    /// still carrying the default title also becomes its title.
    pub async fn append_message(&mut self, session_id: &str, message: Message) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("Unknown chat session: {}", session_id))?;

        if session.has_default_title() && message.is_user_text() && !session.has_user_text() {
            if let Some(text) = &message.content {
                session.title = derive_title(text);
                debug!("Titled session {} as {:?}", session.id, session.title);
            }
        }

        session.messages.push(message);
        self.flush().await
    }

    /// Sessions whose title contains `query` (case-insensitive), newest
    /// insertion first.
    pub fn search(&self, query: &str) -> Vec<&ChatSession> {
        let needle = query.to_lowercase();
        self.sessions
            .iter()
            .rev()
            .filter(|s| s.title.to_lowercase().contains(&needle))
            .collect()
    }

    async fn flush(&self) -> Result<()> {
        self.store.save_sessions(&self.sessions).await
    }
}
