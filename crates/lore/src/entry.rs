//! Knowledge entry and knowledge base definitions.

use serde::{Deserialize, Serialize};
use storyloom_core::Role;

fn next_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// How secondary keywords combine with the primary match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryLogic {
    /// All secondary keywords must match.
    #[default]
    And,
    /// Any secondary keyword may match.
    Or,
    /// No secondary keyword may match.
    Not,
}

/// Where an activated entry's content is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LorePosition {
    /// Before the main prompt block.
    #[default]
    BeforeMain,
    /// After the main prompt block.
    AfterMain,
    /// Injected into chat history at a depth offset from the end.
    AtDepth,
}

/// One lore fragment guarded by keyword rules.
///
/// Invariant: an entry with an empty primary keyword set and
/// `constant = false` never activates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Unique entry id within its book
    #[serde(default = "next_id")]
    pub id: String,

    /// Human label for diagnostics
    #[serde(default)]
    pub comment: String,

    /// Primary keywords, OR-matched against the scan buffer
    #[serde(default)]
    pub keys: Vec<String>,

    /// Secondary keywords, combined per `selective_logic`
    #[serde(default)]
    pub secondary_keys: Vec<String>,

    /// How the secondary keywords gate activation
    #[serde(default)]
    pub selective_logic: SecondaryLogic,

    /// The lore text inserted on activation
    #[serde(default)]
    pub content: String,

    /// Disabled entries are invisible to the scanner
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Always active regardless of message content
    #[serde(default)]
    pub constant: bool,

    /// Ascending priority: lower order = higher priority
    #[serde(default = "default_order")]
    pub order: i32,

    /// Where the content lands in the assembled prompt
    #[serde(default)]
    pub position: LorePosition,

    /// Insertion offset from the end of history; only meaningful for
    /// `LorePosition::AtDepth`
    #[serde(default)]
    pub depth: usize,

    /// Role used when injected into history at depth
    #[serde(default = "default_role")]
    pub role: Role,

    /// Whether this entry's own content can trigger other entries
    #[serde(default)]
    pub recursive: bool,

    /// Mutual-exclusivity tag; empty = no group
    #[serde(default)]
    pub inclusion_group: String,

    /// Match keywords case-sensitively
    #[serde(default)]
    pub case_sensitive: bool,

    /// Require keyword matches on word boundaries
    #[serde(default)]
    pub match_whole_words: bool,

    /// Activation chance in percent, gated by `use_probability`
    #[serde(default = "default_probability")]
    pub probability: u8,

    /// Whether the probability gate applies
    #[serde(default)]
    pub use_probability: bool,
}

fn default_true() -> bool {
    true
}

fn default_order() -> i32 {
    100
}

fn default_role() -> Role {
    Role::System
}

fn default_probability() -> u8 {
    100
}

impl KnowledgeEntry {
    /// Create an enabled entry with the given keywords and content.
    pub fn new(keys: Vec<String>, content: impl Into<String>) -> Self {
        Self {
            id: next_id(),
            comment: String::new(),
            keys,
            secondary_keys: Vec::new(),
            selective_logic: SecondaryLogic::default(),
            content: content.into(),
            enabled: true,
            constant: false,
            order: default_order(),
            position: LorePosition::default(),
            depth: 0,
            role: Role::System,
            recursive: false,
            inclusion_group: String::new(),
            case_sensitive: false,
            match_whole_words: false,
            probability: default_probability(),
            use_probability: false,
        }
    }
}

/// An ordered collection of lore entries plus book-level scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    /// Book name
    pub name: String,

    /// Entries in author order
    #[serde(default)]
    pub entries: Vec<KnowledgeEntry>,

    /// How many recent messages feed the scan buffer
    #[serde(default = "default_scan_depth")]
    pub scan_depth: i32,

    /// Whether activated entries' content may trigger further entries
    #[serde(default = "default_true")]
    pub recursive_scanning: bool,
}

fn default_scan_depth() -> i32 {
    2
}

impl KnowledgeBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            scan_depth: default_scan_depth(),
            recursive_scanning: true,
        }
    }

    /// Combine several books into one virtual book for a conversation.
    ///
    /// Disabled entries are dropped; the effective scan depth is the maximum
    /// across constituents and recursion stays enabled only if every
    /// constituent enables it. Entries are ordered by ascending `order`.
    /// Returns `None` when no enabled entries remain.
    pub fn combine<'a>(books: impl IntoIterator<Item = &'a KnowledgeBase>) -> Option<KnowledgeBase> {
        let mut entries: Vec<KnowledgeEntry> = Vec::new();
        let mut scan_depth = default_scan_depth();
        let mut recursive = true;

        for book in books {
            scan_depth = scan_depth.max(book.scan_depth);
            if !book.recursive_scanning {
                recursive = false;
            }
            entries.extend(book.entries.iter().filter(|e| e.enabled).cloned());
        }

        if entries.is_empty() {
            return None;
        }

        entries.sort_by_key(|e| e.order);

        Some(KnowledgeBase {
            name: "Combined".into(),
            entries,
            scan_depth,
            recursive_scanning: recursive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with(entries: Vec<KnowledgeEntry>, scan_depth: i32, recursive: bool) -> KnowledgeBase {
        KnowledgeBase {
            name: "test".into(),
            entries,
            scan_depth,
            recursive_scanning: recursive,
        }
    }

    #[test]
    fn combine_takes_max_scan_depth() {
        let a = book_with(vec![KnowledgeEntry::new(vec!["a".into()], "A")], 3, true);
        let b = book_with(vec![KnowledgeEntry::new(vec!["b".into()], "B")], 7, true);

        let combined = KnowledgeBase::combine([&a, &b]).unwrap();
        assert_eq!(combined.scan_depth, 7);
        assert!(combined.recursive_scanning);
        assert_eq!(combined.entries.len(), 2);
    }

    #[test]
    fn combine_recursion_requires_all() {
        let a = book_with(vec![KnowledgeEntry::new(vec!["a".into()], "A")], 2, true);
        let b = book_with(vec![KnowledgeEntry::new(vec!["b".into()], "B")], 2, false);

        let combined = KnowledgeBase::combine([&a, &b]).unwrap();
        assert!(!combined.recursive_scanning);
    }

    #[test]
    fn combine_drops_disabled_entries() {
        let mut off = KnowledgeEntry::new(vec!["x".into()], "X");
        off.enabled = false;
        let a = book_with(vec![off], 2, true);

        assert!(KnowledgeBase::combine([&a]).is_none());
    }

    #[test]
    fn combine_sorts_by_order() {
        let mut hi = KnowledgeEntry::new(vec!["a".into()], "A");
        hi.order = 200;
        let mut lo = KnowledgeEntry::new(vec!["b".into()], "B");
        lo.order = 10;
        let a = book_with(vec![hi, lo], 2, true);

        let combined = KnowledgeBase::combine([&a]).unwrap();
        assert_eq!(combined.entries[0].content, "B");
        assert_eq!(combined.entries[1].content, "A");
    }

    #[test]
    fn entry_deserializes_with_defaults() {
        let entry: KnowledgeEntry =
            serde_json::from_str(r#"{"keys": ["dragon"], "content": "Dragons exist."}"#).unwrap();
        assert!(entry.enabled);
        assert!(!entry.constant);
        assert_eq!(entry.order, 100);
        assert_eq!(entry.probability, 100);
        assert_eq!(entry.position, LorePosition::BeforeMain);
        assert_eq!(entry.selective_logic, SecondaryLogic::And);
    }
}
