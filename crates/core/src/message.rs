//! Message and ChatSession domain types.
//!
//! These are the core value objects that flow through the entire system:
//! the user sends a message → the pipeline generates a narrative turn →
//! the session records both, plus any image and audio references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::AudioRef;

/// Unique identifier for a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The narrating assistant
    Assistant,
    /// System instructions (prompts, lore injections)
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single message in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Illustration attached to this turn (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// The prompt the illustration was generated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,

    /// Synthesized dialogue audio for this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<AudioRef>,

    /// Optional metadata (stage info, vendor info, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            image_url: None,
            image_prompt: None,
            audio: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Attach an image reference to this message.
    pub fn with_image(mut self, url: impl Into<String>, prompt: Option<String>) -> Self {
        self.image_url = Some(url.into());
        self.image_prompt = prompt;
        self
    }

    /// Attach synthesized audio to this message.
    pub fn with_audio(mut self, audio: Vec<AudioRef>) -> Self {
        self.audio = audio;
        self
    }
}

/// A chat session is an ordered sequence of messages plus the context
/// selection (character, worldbooks, preset) the user picked for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    /// Unique session ID
    pub id: SessionId,

    /// The character this session is played with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,

    /// Display name of the character (denormalized for listings)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,

    /// Worldbooks active in this session
    #[serde(default)]
    pub worldbook_ids: Vec<String>,

    /// Preset active in this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_id: Option<String>,

    /// Ordered messages
    pub messages: Vec<Message>,

    /// When this session was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    /// Create a new empty session.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            character_id: None,
            character_name: None,
            worldbook_ids: Vec::new(),
            preset_id: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a session opened with a character's greeting as the first
    /// assistant message. Only `{{char}}` and `{{user}}` are expanded here;
    /// full macro expansion happens at prompt-assembly time.
    pub fn with_greeting(character: &crate::character::Character, user_name: &str) -> Self {
        let mut session = Self::new();
        session.character_id = Some(character.id.clone());
        session.character_name = Some(character.name.clone());
        if !character.first_mes.is_empty() {
            let greeting = character
                .first_mes
                .replace("{{char}}", &character.name)
                .replace("{{user}}", user_name);
            session.messages.push(Message::assistant(greeting));
        }
        session
    }

    /// Add a message to the session.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// The last message with the given role, if any.
    pub fn last_of(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == role)
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}
