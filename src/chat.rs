use chrono::{Local, NaiveDateTime};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Title every session starts with until it is renamed or derived from the
/// first user message.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Greeting for sessions created on startup or as a replacement for the
/// last deleted session.
pub const WELCOME_GREETING: &str = "👋 Hi! How can I help you today?";

/// Greeting for sessions created through "new chat".
pub const NEW_CHAT_GREETING: &str = "✨ New conversation started.";

const TITLE_MAX_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation. A message carries either text or an image,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Base64-encoded PNG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub time: NaiveDateTime,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            image: None,
            time: now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn user_image(png_base64: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: None,
            image: Some(png_base64.into()),
            time: now(),
        }
    }

    pub fn is_user_text(&self) -> bool {
        self.role == Role::User && self.content.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl ChatSession {
    /// Fresh session with a random id, the default title and one assistant
    /// greeting.
    pub fn new(greeting: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages: vec![Message::assistant(greeting)],
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }

    pub fn has_user_text(&self) -> bool {
        self.messages.iter().any(Message::is_user_text)
    }
}

/// Title derived from a user message: the first 30 characters, with `...`
/// appended when anything was cut.
pub fn derive_title(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Sessions keyed by id, in insertion order.
///
/// Serialized as a JSON object whose keys are the session ids; the key order
/// in the file is the collection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionCollection {
    sessions: Vec<ChatSession>,
}

impl SessionCollection {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn first(&self) -> Option<&ChatSession> {
        self.sessions.first()
    }

    /// Inserts at the end, or replaces in place when the id already exists.
    pub fn insert(&mut self, session: ChatSession) {
        match self.get_mut(&session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ChatSession> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(index))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ChatSession> {
        self.sessions.iter()
    }
}

#[derive(Serialize)]
struct SessionRecordRef<'a> {
    title: &'a str,
    messages: &'a [Message],
}

#[derive(Deserialize)]
struct SessionRecord {
    title: String,
    #[serde(default)]
    messages: Vec<Message>,
}

impl Serialize for SessionCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.sessions.len()))?;
        for session in &self.sessions {
            map.serialize_entry(
                &session.id,
                &SessionRecordRef {
                    title: &session.title,
                    messages: &session.messages,
                },
            )?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SessionCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CollectionVisitor;

        impl<'de> Visitor<'de> for CollectionVisitor {
            type Value = SessionCollection;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of session id to session record")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut collection = SessionCollection::new();
                while let Some((id, record)) = access.next_entry::<String, SessionRecord>()? {
                    collection.insert(ChatSession {
                        id,
                        title: record.title,
                        messages: record.messages,
                    });
                }
                Ok(collection)
            }
        }

        deserializer.deserialize_map(CollectionVisitor)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeConfig {
    pub theme: Theme,
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
