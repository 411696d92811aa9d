//! Dialogue extraction from narrative text.
//!
//! The writer's output carries character speech in several conventions:
//! explicit `<dialogue>` tags with character/emotion attributes, and
//! `Speaker:` prefixes followed by corner-bracket, curly, or straight
//! quotes. Extraction supports the whole set and deduplicates identical
//! lines (first occurrence wins); relative precedence among the quote
//! conventions is not a contract.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One extracted dialogue line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialogue {
    /// The speaking character
    pub speaker: String,
    /// Emotion tag; "neutral" unless the markup says otherwise
    pub emotion: String,
    /// The spoken text, trimmed
    pub text: String,
}

/// Extract character dialogue lines from narrative text.
pub fn extract_dialogues(text: &str) -> Vec<Dialogue> {
    let mut dialogues: Vec<Dialogue> = Vec::new();

    let mut push_unique = |speaker: &str, emotion: &str, line: &str| {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if dialogues.iter().any(|d| d.text == line) {
            return;
        }
        dialogues.push(Dialogue {
            speaker: speaker.to_string(),
            emotion: if emotion.is_empty() {
                "neutral".to_string()
            } else {
                emotion.to_string()
            },
            text: line.to_string(),
        });
    };

    // Tagged dialogue carries emotion metadata, so it is scanned first.
    let tagged = Regex::new(
        r#"(?s)<dialogue\s+character="([^"]+)"(?:\s+emotion="([^"]+)")?\s*>(.*?)</dialogue>"#,
    )
    .expect("static pattern");
    for caps in tagged.captures_iter(text) {
        let emotion = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        push_unique(&caps[1], emotion, &caps[3]);
    }

    // Speaker: 「line」 (corner brackets)
    let corner = Regex::new(r"([A-Za-z\p{Han}\p{Hiragana}\p{Katakana}]+)[：:]\s*「([^」]+)」")
        .expect("static pattern");
    for caps in corner.captures_iter(text) {
        push_unique(&caps[1], "", &caps[2]);
    }

    // Speaker: “line” (curly quotes)
    let curly =
        Regex::new(r"([A-Za-z\p{Han}]+)[：:]\s*“([^”]+)”").expect("static pattern");
    for caps in curly.captures_iter(text) {
        push_unique(&caps[1], "", &caps[2]);
    }

    // Speaker: "line" (straight quotes)
    let straight =
        Regex::new(r#"([A-Za-z\p{Han}]+)[：:]\s*"([^"]+)""#).expect("static pattern");
    for caps in straight.captures_iter(text) {
        push_unique(&caps[1], "", &caps[2]);
    }

    dialogues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_dialogue_with_emotion() {
        let text = r#"<dialogue character="Mira" emotion="joy">We made it!</dialogue>"#;
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].speaker, "Mira");
        assert_eq!(result[0].emotion, "joy");
        assert_eq!(result[0].text, "We made it!");
    }

    #[test]
    fn tagged_dialogue_defaults_to_neutral() {
        let text = r#"<dialogue character="Mira">Quiet now.</dialogue>"#;
        let result = extract_dialogues(text);
        assert_eq!(result[0].emotion, "neutral");
    }

    #[test]
    fn extracts_corner_bracket_quotes() {
        let text = "Mira: 「The storm is coming.」";
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].speaker, "Mira");
        assert_eq!(result[0].text, "The storm is coming.");
    }

    #[test]
    fn extracts_full_width_colon() {
        let text = "ミラ：「嵐が来る」";
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].speaker, "ミラ");
    }

    #[test]
    fn extracts_curly_and_straight_quotes() {
        let text = "Mira: “First line.” Joren: \"Second line.\"";
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].text, "First line.");
        assert_eq!(result[1].speaker, "Joren");
    }

    #[test]
    fn duplicate_lines_deduplicated() {
        let text = "Mira: \"Hello there.\"\nJoren: \"A fine day.\"\nMira: \"Hello there.\"";
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn dedup_across_conventions() {
        let text = r#"<dialogue character="Mira">Hold on.</dialogue> Mira: "Hold on.""#;
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 1);
        // The tagged match is kept; it carries the richer metadata.
        assert_eq!(result[0].speaker, "Mira");
    }

    #[test]
    fn narrative_without_dialogue_yields_nothing() {
        let text = "The rain fell in sheets over the empty market.";
        assert!(extract_dialogues(text).is_empty());
    }

    #[test]
    fn multiline_tagged_dialogue() {
        let text = "<dialogue character=\"Mira\">Line one\nline two</dialogue>";
        let result = extract_dialogues(text);
        assert_eq!(result.len(), 1);
        assert!(result[0].text.contains("line two"));
    }
}
