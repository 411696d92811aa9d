//! Preset and template entry definitions.

use serde::{Deserialize, Serialize};
use storyloom_core::GenerationParams;

/// Where a template entry's expanded text lands relative to chat history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPosition {
    /// Ordinary pre-history content.
    #[default]
    Normal,
    /// Pre-history, conventionally ahead of the character block.
    BeforeMain,
    /// Pre-history, conventionally behind the character block.
    AfterMain,
    /// Appended after the chat history.
    PostHistory,
    /// Appended after the chat history (jailbreak slot).
    Jailbreak,
    /// Pure ordering anchor marking where history goes; contributes no text.
    HistoryMarker,
}

impl SlotPosition {
    /// Whether expanded text routes to the post-history block.
    pub fn is_post_history(self) -> bool {
        matches!(self, Self::PostHistory | Self::Jailbreak)
    }
}

/// One entry in a preset's prompt scaffold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub id: String,

    /// Human name shown in editors
    #[serde(default)]
    pub name: String,

    /// Raw content; may contain macros
    #[serde(default)]
    pub content: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ordering key (not time): entries assemble in ascending depth
    #[serde(default)]
    pub depth: i32,

    #[serde(default)]
    pub position: SlotPosition,

    /// Whether the user may delete this entry in editors
    #[serde(default = "default_true")]
    pub deletable: bool,
}

fn default_true() -> bool {
    true
}

impl TemplateEntry {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            content: content.into(),
            enabled: true,
            depth: 0,
            position: SlotPosition::default(),
            deletable: true,
        }
    }

    pub fn at(mut self, position: SlotPosition) -> Self {
        self.position = position;
        self
    }

    pub fn with_depth(mut self, depth: i32) -> Self {
        self.depth = depth;
        self
    }
}

/// A named, ordered set of template entries plus generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub prompt_entries: Vec<TemplateEntry>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Ask for reasoning deltas where the model supports them
    #[serde(default)]
    pub enable_cot: bool,

    /// Regex rules scoped to this preset's pipeline stage
    #[serde(default)]
    pub filter_rule_ids: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

impl Preset {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt_entries: Vec::new(),
            temperature: default_temperature(),
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            enable_cot: false,
            filter_rule_ids: Vec::new(),
        }
    }

    pub fn with_entries(mut self, entries: Vec<TemplateEntry>) -> Self {
        self.prompt_entries = entries;
        self
    }

    /// Sampling parameters for a generation call with this preset.
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            enable_thinking: self.enable_cot,
        }
    }
}
