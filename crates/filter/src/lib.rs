//! Scoped regex find/replace rules.
//!
//! Users author ordered find/replace rules that post-process generated text.
//! Each rule declares where it applies: which pipeline stages' output it may
//! rewrite, whether it governs text bound for the next prompt or text shown
//! to the user, and (for chat display) a message-depth window. Invalid
//! patterns are skipped with a diagnostic — a bad rule never aborts
//! processing.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pipeline stages whose output can be rewritten by rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Director,
    Writer,
    PaintDirector,
}

/// Whether a rewrite applies to prompt-bound or display-bound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Prompt,
    Display,
}

/// Who authored the message being processed (chat scope only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One ordered find/replace rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexRule {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// The pattern to find
    pub find: String,

    /// Replacement template; supports `$0`–`$9` and the literal `{{match}}`
    #[serde(default)]
    pub replace: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Flag string over {g, i, m, s}; `g` = replace all occurrences
    #[serde(default = "default_flags")]
    pub flags: String,

    /// Stage applicability
    #[serde(default)]
    pub run_on_director: bool,
    #[serde(default = "default_true")]
    pub run_on_writer: bool,
    #[serde(default)]
    pub run_on_paint_director: bool,

    /// Chat applicability
    #[serde(default)]
    pub run_on_user_input: bool,
    #[serde(default = "default_true")]
    pub run_on_ai_output: bool,

    /// Target applicability
    #[serde(default = "default_true")]
    pub affect_display: bool,
    #[serde(default)]
    pub affect_prompt: bool,

    /// Depth window for chat display processing (0 = most recent message)
    #[serde(default)]
    pub min_depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,

    /// Application order among rules
    #[serde(default)]
    pub order_index: i32,
}

fn default_true() -> bool {
    true
}

fn default_flags() -> String {
    "g".into()
}

impl RegexRule {
    /// Create an enabled rule with default applicability.
    pub fn new(id: impl Into<String>, find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            find: find.into(),
            replace: replace.into(),
            enabled: true,
            flags: default_flags(),
            run_on_director: false,
            run_on_writer: true,
            run_on_paint_director: false,
            run_on_user_input: false,
            run_on_ai_output: true,
            affect_display: true,
            affect_prompt: false,
            min_depth: 0,
            max_depth: None,
            order_index: 0,
        }
    }
}

/// Where the text being processed came from and where it is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// Output of a pipeline stage.
    Stage { stage: FilterStage, target: Target },
    /// A chat message at a given depth from the end of history.
    Chat {
        role: ChatRole,
        target: Target,
        depth: usize,
    },
}

/// Apply every applicable rule to `text`, in `order_index` order.
pub fn apply(text: &str, rules: &[RegexRule], scope: &FilterScope) -> String {
    let mut ordered: Vec<&RegexRule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by_key(|r| r.order_index);

    let mut result = text.to_string();
    for rule in ordered {
        if !rule_applies(rule, scope) {
            continue;
        }
        result = apply_one(&result, rule);
    }
    result
}

/// Output of a pipeline stage, bound for the next stage's prompt or display.
pub fn apply_for_stage(
    text: &str,
    rules: &[RegexRule],
    stage: FilterStage,
    target: Target,
) -> String {
    apply(text, rules, &FilterScope::Stage { stage, target })
}

/// A chat message being prepared for display.
pub fn apply_for_display(text: &str, rules: &[RegexRule], role: ChatRole, depth: usize) -> String {
    apply(
        text,
        rules,
        &FilterScope::Chat {
            role,
            target: Target::Display,
            depth,
        },
    )
}

fn rule_applies(rule: &RegexRule, scope: &FilterScope) -> bool {
    match scope {
        FilterScope::Stage { stage, target } => {
            let stage_ok = match stage {
                FilterStage::Director => rule.run_on_director,
                FilterStage::Writer => rule.run_on_writer,
                FilterStage::PaintDirector => rule.run_on_paint_director,
            };
            stage_ok && target_applies(rule, *target)
        }
        FilterScope::Chat {
            role,
            target,
            depth,
        } => {
            let role_ok = match role {
                ChatRole::User => rule.run_on_user_input,
                ChatRole::Assistant => rule.run_on_ai_output,
            };
            let depth_ok =
                *depth >= rule.min_depth && rule.max_depth.is_none_or(|max| *depth <= max);
            role_ok && target_applies(rule, *target) && depth_ok
        }
    }
}

fn target_applies(rule: &RegexRule, target: Target) -> bool {
    match target {
        Target::Display => rule.affect_display,
        Target::Prompt => rule.affect_prompt,
    }
}

fn apply_one(text: &str, rule: &RegexRule) -> String {
    let regex = RegexBuilder::new(&rule.find)
        .case_insensitive(rule.flags.contains('i'))
        .dot_matches_new_line(rule.flags.contains('s'))
        .multi_line(rule.flags.contains('m'))
        .build();

    let regex = match regex {
        Ok(r) => r,
        Err(e) => {
            warn!(rule = %rule.id, name = %rule.name, error = %e, "Invalid regex rule, skipping");
            return text.to_string();
        }
    };

    let limit = if rule.flags.contains('g') { 0 } else { 1 };
    regex
        .replacen(text, limit, |caps: &regex::Captures<'_>| {
            render_replacement(&rule.replace, caps)
        })
        .into_owned()
}

/// Build the replacement for one match: `{{match}}`/`$0` become the whole
/// match, `$1`–`$9` become capture groups. References to absent groups stay
/// literal.
fn render_replacement(template: &str, caps: &regex::Captures<'_>) -> String {
    let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
    let mut out = template
        .replace("{{match}}", whole)
        .replace("{{MATCH}}", whole);
    out = out.replace("$0", whole);
    for i in 1..=9usize {
        if let Some(group) = caps.get(i) {
            out = out.replace(&format!("${i}"), group.as_str());
        }
    }
    out
}
