//! The expansion pass itself.

use chrono::Local;
use rand::Rng;
use regex::{Captures, Regex};

use crate::context::MacroContext;

/// Expand all recognized macros in `text` against `ctx`.
///
/// Resolution order: literal vocabulary, `{{trim}}`, `{{roll:...}}`,
/// `{{random:...}}`. Unrecognized macros are left verbatim; malformed roll
/// expressions are left verbatim. The function is total and, for text with
/// no remaining macros, idempotent.
pub fn expand(text: &str, ctx: &MacroContext) -> String {
    if text.is_empty() {
        return String::new();
    }

    let simple = Regex::new(r"(?i)\{\{([a-z_]+)\}\}").expect("static pattern");
    let mut result = simple
        .replace_all(text, |caps: &Captures<'_>| {
            match lookup(&caps[1].to_lowercase(), ctx) {
                Some(value) => value,
                // Unknown vocabulary (and {{trim}}, handled below): verbatim.
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    // Legacy angle-bracket aliases.
    let bot = Regex::new(r"(?i)<BOT>").expect("static pattern");
    result = bot.replace_all(&result, ctx.char_name.as_str()).into_owned();
    let user = Regex::new(r"(?i)<USER>").expect("static pattern");
    result = user.replace_all(&result, ctx.user_name.as_str()).into_owned();

    // {{trim}} eats itself plus surrounding whitespace.
    let trim = Regex::new(r"(?i)\s*\{\{trim\}\}\s*").expect("static pattern");
    result = trim.replace_all(&result, "").into_owned();

    // {{roll:XdY+Z}} — uniform roll per die, summed, plus modifier.
    let roll = Regex::new(r"(?i)\{\{roll:([^}]+)\}\}").expect("static pattern");
    result = roll
        .replace_all(&result, |caps: &Captures<'_>| {
            match roll_dice(caps[1].trim()) {
                Some(total) => total.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    // {{random:a,b,c}} — uniform choice over trimmed options.
    let random = Regex::new(r"(?i)\{\{random:([^}]+)\}\}").expect("static pattern");
    result = random
        .replace_all(&result, |caps: &Captures<'_>| {
            let options: Vec<&str> = caps[1].split(',').collect();
            let pick = rand::rng().random_range(0..options.len());
            options[pick].trim().to_string()
        })
        .into_owned();

    // Collapse the gaps left by empty substitutions.
    result = result.replace("\n\n\n", "\n\n");
    result.trim().to_string()
}

/// Map a lowercased macro name to its value. `None` means "not ours" and the
/// macro stays verbatim.
fn lookup(name: &str, ctx: &MacroContext) -> Option<String> {
    let value = match name {
        "char" => ctx.char_name.clone(),
        "user" => ctx.user_name.clone(),
        "description" => ctx.description.clone(),
        "personality" => ctx.personality.clone(),
        "scenario" => ctx.scenario.clone(),
        "persona" => ctx.user_persona.clone(),
        "system" | "charprompt" => ctx.system_prompt.clone(),
        "first_mes" => ctx.first_mes.clone(),
        "charjailbreak" => ctx.post_history_instructions.clone(),
        "charversion" => ctx.character_version.clone(),
        "wibefore" | "lorebefore" | "worldbook" => ctx.lore_before.clone(),
        "wiafter" | "loreafter" => ctx.lore_after.clone(),
        "mesexamples" | "mesexamplesraw" | "example_dialogue" => ctx.example_dialogue.clone(),
        "character" | "charcard" => ctx.card_block.clone(),
        "lastcharmessage" => ctx.last_char_message.clone(),
        "lastusermessage" => ctx.last_user_message.clone(),
        "time" => Local::now().format("%H:%M").to_string(),
        "date" => Local::now().format("%Y-%m-%d").to_string(),
        "weekday" => Local::now().format("%A").to_string(),
        "isotime" => Local::now().to_rfc3339(),
        "newline" => "\n".into(),
        "noop" => String::new(),
        _ => return None,
    };
    Some(value)
}

/// Evaluate an `XdY+Z` dice expression. X and the modifier are optional.
/// Returns `None` for anything malformed (including zero-sided dice).
fn roll_dice(expr: &str) -> Option<i64> {
    let pattern = Regex::new(r"(?i)^(\d*)d(\d+)([+-]\d+)?$").expect("static pattern");
    let caps = pattern.captures(expr)?;

    let num_dice: u32 = if caps[1].is_empty() {
        1
    } else {
        caps[1].parse().ok()?
    };
    let sides: u32 = caps[2].parse().ok()?;
    if sides == 0 {
        return None;
    }
    let modifier: i64 = match caps.get(3) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };

    let mut rng = rand::rng();
    let mut total = modifier;
    for _ in 0..num_dice {
        total += rng.random_range(1..=sides) as i64;
    }
    Some(total)
}
