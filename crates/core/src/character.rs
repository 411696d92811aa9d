//! Character card and user persona value objects.
//!
//! A Character bundles everything the prompt layer can reference about the
//! persona being played: descriptive fields, prompt overrides, the greeting,
//! and example dialogue. Persistence of cards is a collaborator concern.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A character card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    /// Unique card ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Free-text description of the character
    #[serde(default)]
    pub description: String,

    /// Personality summary
    #[serde(default)]
    pub personality: String,

    /// Scenario framing for the conversation
    #[serde(default)]
    pub scenario: String,

    /// Main system prompt override
    #[serde(default)]
    pub system_prompt: String,

    /// Instructions appended after the chat history
    #[serde(default)]
    pub post_history_instructions: String,

    /// Greeting shown when a session starts
    #[serde(default)]
    pub first_mes: String,

    /// Example dialogue demonstrating the character's voice
    #[serde(default)]
    pub mes_example: String,

    /// Card version string
    #[serde(default = "default_version")]
    pub character_version: String,

    /// Author notes, never sent to the model
    #[serde(default)]
    pub creator_notes: String,
}

fn default_version() -> String {
    "1.0".into()
}

impl Character {
    /// Create a minimal card with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            personality: String::new(),
            scenario: String::new(),
            system_prompt: String::new(),
            post_history_instructions: String::new(),
            first_mes: String::new(),
            mes_example: String::new(),
            character_version: default_version(),
            creator_notes: String::new(),
        }
    }

    /// Compose the full-card block used by the `{{character}}` macro:
    /// name, description, and personality, one per line, skipping blanks.
    pub fn card_block(&self) -> String {
        let mut parts = Vec::new();
        if !self.name.is_empty() {
            parts.push(format!("Character: {}", self.name));
        }
        if !self.description.is_empty() {
            parts.push(self.description.clone());
        }
        if !self.personality.is_empty() {
            parts.push(format!("Personality: {}", self.personality));
        }
        parts.join("\n")
    }
}

/// The user-side persona: how the user is addressed and described.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// The user's display name
    pub name: String,

    /// Free-text persona description
    #[serde(default)]
    pub description: String,
}

impl Persona {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::new("User")
    }
}
