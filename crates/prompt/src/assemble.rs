//! The assembly pass: lore scan → macro expansion → ordered prompt blocks.

use serde::{Deserialize, Serialize};
use storyloom_core::adapter::ChatTurn;
use storyloom_core::{Character, Message, Persona, Role};
use storyloom_lore::{KnowledgeBase, LorePosition, scan};
use storyloom_template::{MacroContext, expand};
use tracing::debug;

use crate::preset::{Preset, SlotPosition};

/// A lore entry bound for injection into chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthInjection {
    pub content: String,
    /// Offset from the end of history: 0 = after the newest message.
    pub depth: usize,
    pub role: Role,
    pub order: i32,
}

/// The output of one assembly pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssembledPrompt {
    /// Everything placed before the chat history.
    pub pre_history: String,
    /// Everything placed after the chat history (post-history + jailbreak).
    pub post_history: String,
    /// Lore entries to be spliced into history, sorted by (depth, order).
    pub depth_injections: Vec<DepthInjection>,
}

impl AssembledPrompt {
    /// The combined single system message used by pipeline stages.
    pub fn system_prompt(&self) -> String {
        match (self.pre_history.is_empty(), self.post_history.is_empty()) {
            (false, false) => format!("{}\n\n{}", self.pre_history, self.post_history),
            (false, true) => self.pre_history.clone(),
            (true, false) => self.post_history.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Assemble the prompt blocks for one generation call.
///
/// Template entry ordering is never changed except by the ascending `depth`
/// sort. A preset without entries yields empty strings, not an error.
pub fn assemble(
    character: Option<&Character>,
    book: Option<&KnowledgeBase>,
    preset: Option<&Preset>,
    history: &[Message],
    persona: &Persona,
) -> AssembledPrompt {
    // Lore first: the macro context needs the before/after blocks.
    let mut before_parts: Vec<String> = Vec::new();
    let mut after_parts: Vec<String> = Vec::new();
    let mut depth_injections: Vec<DepthInjection> = Vec::new();

    if let Some(book) = book {
        let activated = scan(book, history);
        debug!(count = activated.len(), book = %book.name, "lore entries activated");
        for entry in activated {
            if entry.content.is_empty() {
                continue;
            }
            match entry.position {
                LorePosition::AtDepth => depth_injections.push(DepthInjection {
                    content: entry.content,
                    depth: entry.depth,
                    role: entry.role,
                    order: entry.order,
                }),
                LorePosition::AfterMain => after_parts.push(entry.content),
                LorePosition::BeforeMain => before_parts.push(entry.content),
            }
        }
    }

    depth_injections.sort_by_key(|d| (d.depth, d.order));

    let lore_before = before_parts.join("\n\n");
    let lore_after = after_parts.join("\n\n");
    let ctx = MacroContext::build(character, persona, lore_before, lore_after, history);

    let mut pre_parts: Vec<String> = Vec::new();
    let mut post_parts: Vec<String> = Vec::new();

    if let Some(preset) = preset {
        let mut entries: Vec<_> = preset.prompt_entries.iter().collect();
        entries.sort_by_key(|e| e.depth);

        for entry in entries {
            if !entry.enabled || entry.content.is_empty() {
                continue;
            }
            // History markers only anchor ordering; the literal macro form
            // is honored for imported presets.
            if entry.position == SlotPosition::HistoryMarker
                || entry.content.contains("{{chatHistory}}")
            {
                continue;
            }

            let expanded = expand(&entry.content, &ctx);
            if expanded.trim().is_empty() {
                debug!(entry = %entry.id, "template entry empty after expansion, skipped");
                continue;
            }

            if entry.position.is_post_history() {
                post_parts.push(expanded);
            } else {
                pre_parts.push(expanded);
            }
        }
    }

    AssembledPrompt {
        pre_history: pre_parts.join("\n\n"),
        post_history: post_parts.join("\n\n"),
        depth_injections,
    }
}

/// Splice depth injections into a turn list.
///
/// Each injection lands at `max(0, len − depth)` from the start — `depth`
/// counted from the most recent message backward. Injections are applied in
/// their listed order against the growing list.
pub fn inject_depth_entries(turns: &mut Vec<ChatTurn>, injections: &[DepthInjection]) {
    for injection in injections {
        let pos = turns.len().saturating_sub(injection.depth);
        turns.insert(pos, ChatTurn::new(injection.role, injection.content.clone()));
    }
}
