//! The macro resolution context.

use storyloom_core::{Character, Message, Persona, Role};

/// Last-message excerpts are capped at this many characters.
const EXCERPT_LIMIT: usize = 500;

/// Everything the macro vocabulary can reference, gathered up front.
///
/// Built once per assembly pass from the character, the activated lore
/// blocks, and the conversation history.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
    /// Character name (`{{char}}`)
    pub char_name: String,
    /// Character description (`{{description}}`)
    pub description: String,
    /// Character personality (`{{personality}}`)
    pub personality: String,
    /// Scenario framing (`{{scenario}}`)
    pub scenario: String,
    /// Character system prompt (`{{system}}`, `{{charPrompt}}`)
    pub system_prompt: String,
    /// Post-history instructions (`{{charJailbreak}}`)
    pub post_history_instructions: String,
    /// Greeting (`{{first_mes}}`)
    pub first_mes: String,
    /// Card version (`{{charVersion}}`)
    pub character_version: String,
    /// Composed card block (`{{character}}`, `{{charCard}}`)
    pub card_block: String,
    /// User display name (`{{user}}`)
    pub user_name: String,
    /// User persona description (`{{persona}}`)
    pub user_persona: String,
    /// Activated lore placed before the main block (`{{wiBefore}}`)
    pub lore_before: String,
    /// Activated lore placed after the main block (`{{wiAfter}}`)
    pub lore_after: String,
    /// Example dialogue (`{{mesExamples}}`)
    pub example_dialogue: String,
    /// Last assistant message, truncated (`{{lastCharMessage}}`)
    pub last_char_message: String,
    /// Last user message, truncated (`{{lastUserMessage}}`)
    pub last_user_message: String,
}

impl MacroContext {
    /// Build a context from the character, lore blocks, and history.
    pub fn build(
        character: Option<&Character>,
        persona: &Persona,
        lore_before: impl Into<String>,
        lore_after: impl Into<String>,
        history: &[Message],
    ) -> Self {
        let mut ctx = Self {
            user_name: persona.name.clone(),
            user_persona: persona.description.clone(),
            lore_before: lore_before.into(),
            lore_after: lore_after.into(),
            char_name: "Assistant".into(),
            character_version: "1.0".into(),
            ..Self::default()
        };

        if let Some(c) = character {
            ctx.char_name = c.name.clone();
            ctx.description = c.description.clone();
            ctx.personality = c.personality.clone();
            ctx.scenario = c.scenario.clone();
            ctx.system_prompt = c.system_prompt.clone();
            ctx.post_history_instructions = c.post_history_instructions.clone();
            ctx.first_mes = c.first_mes.clone();
            ctx.character_version = c.character_version.clone();
            ctx.card_block = c.card_block();
            ctx.example_dialogue = c.mes_example.clone();
        }

        ctx.last_char_message = last_excerpt(history, Role::Assistant);
        ctx.last_user_message = last_excerpt(history, Role::User);
        ctx
    }
}

fn last_excerpt(history: &[Message], role: Role) -> String {
    history
        .iter()
        .rev()
        .find(|m| m.role == role)
        .map(|m| truncate(&m.content, EXCERPT_LIMIT))
        .unwrap_or_default()
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        s.chars().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_without_character_uses_defaults() {
        let ctx = MacroContext::build(None, &Persona::default(), "", "", &[]);
        assert_eq!(ctx.char_name, "Assistant");
        assert_eq!(ctx.user_name, "User");
        assert!(ctx.description.is_empty());
    }

    #[test]
    fn build_copies_character_fields() {
        let mut c = Character::new("Mira");
        c.description = "A cartographer.".into();
        c.mes_example = "<START>example".into();

        let ctx = MacroContext::build(Some(&c), &Persona::new("Alex"), "before", "after", &[]);
        assert_eq!(ctx.char_name, "Mira");
        assert_eq!(ctx.description, "A cartographer.");
        assert_eq!(ctx.example_dialogue, "<START>example");
        assert_eq!(ctx.lore_before, "before");
        assert_eq!(ctx.lore_after, "after");
        assert!(ctx.card_block.contains("Character: Mira"));
    }

    #[test]
    fn last_messages_extracted_and_truncated() {
        let long = "x".repeat(800);
        let history = vec![
            Message::user("first question"),
            Message::assistant(long),
            Message::user("second question"),
        ];
        let ctx = MacroContext::build(None, &Persona::default(), "", "", &history);
        assert_eq!(ctx.last_user_message, "second question");
        assert_eq!(ctx.last_char_message.chars().count(), 500);
    }
}
