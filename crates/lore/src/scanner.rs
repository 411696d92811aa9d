//! Keyword scanning and recursive activation.
//!
//! The scan walks enabled entries against a buffer built from recent
//! messages, then lets activated `recursive` entries trigger further entries
//! from their own content. Recursion is implemented as an explicit worklist
//! over entry indices with a visited set, bounded by a depth ceiling, so an
//! entry graph with cycles always terminates and each entry activates at
//! most once.

use rand::Rng;
use regex::RegexBuilder;
use std::collections::{HashMap, HashSet, VecDeque};
use storyloom_core::Message;
use tracing::debug;

use crate::entry::{KnowledgeBase, KnowledgeEntry, SecondaryLogic};

/// Maximum depth of entry-content-triggers-entry chains.
const MAX_RECURSION: usize = 3;

/// Scan recent messages against a knowledge base.
///
/// Returns the activated entries sorted ascending by `order`. The scan never
/// fails: an empty book or empty history yields an empty result.
pub fn scan(book: &KnowledgeBase, messages: &[Message]) -> Vec<KnowledgeEntry> {
    if book.entries.is_empty() {
        return Vec::new();
    }

    let buffer = scan_buffer(messages, book.scan_depth);
    let mut state = ScanState::new(book);

    // First pass: constants and direct matches against the history buffer.
    for (idx, entry) in book.entries.iter().enumerate() {
        if !entry.enabled {
            continue;
        }
        if entry.constant {
            debug!(entry = %label(entry), "lore entry activated: constant");
            state.try_activate(idx, 0);
        } else if entry_matches(entry, &buffer) {
            debug!(entry = %label(entry), keys = ?entry.keys, "lore entry activated: keyword match");
            state.try_activate(idx, 0);
        }
    }

    // Recursive passes: activated recursive entries feed their content back
    // in as additional scan buffers.
    if book.recursive_scanning {
        while let Some((source_idx, level)) = state.worklist.pop_front() {
            if level >= MAX_RECURSION {
                continue;
            }
            let source_content = book.entries[source_idx].content.clone();
            for (idx, entry) in book.entries.iter().enumerate() {
                if idx == source_idx || !entry.enabled || state.activated.contains(&idx) {
                    continue;
                }
                if !entry.constant && entry_matches(entry, &source_content) {
                    debug!(
                        entry = %label(entry),
                        source = %label(&book.entries[source_idx]),
                        level,
                        "lore entry activated: recursive match"
                    );
                    state.try_activate(idx, level + 1);
                }
            }
        }
    }

    let mut result: Vec<KnowledgeEntry> = state
        .activated
        .iter()
        .map(|&idx| book.entries[idx].clone())
        .collect();
    result.sort_by_key(|e| e.order);
    debug!(count = result.len(), "lore scan complete");
    result
}

/// Join the last `scan_depth` messages into one search buffer.
fn scan_buffer(messages: &[Message], scan_depth: i32) -> String {
    if scan_depth <= 0 {
        return String::new();
    }
    let start = messages.len().saturating_sub(scan_depth as usize);
    messages[start..]
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bookkeeping for one scan: the activation set, inclusion-group winners,
/// and the worklist of recursive entries still to expand.
struct ScanState<'a> {
    book: &'a KnowledgeBase,
    /// Indices of activated entries, in activation order.
    activated: Vec<usize>,
    /// Fast membership test alongside `activated`.
    activated_set: HashSet<usize>,
    /// inclusion_group → index of the current winner.
    group_winners: HashMap<String, usize>,
    /// Recursive entries awaiting expansion: (entry index, recursion level).
    worklist: VecDeque<(usize, usize)>,
}

impl<'a> ScanState<'a> {
    fn new(book: &'a KnowledgeBase) -> Self {
        Self {
            book,
            activated: Vec::new(),
            activated_set: HashSet::new(),
            group_winners: HashMap::new(),
            worklist: VecDeque::new(),
        }
    }

    /// Admit an entry into the activation set, resolving inclusion-group
    /// conflicts. Idempotent per entry.
    fn try_activate(&mut self, idx: usize, level: usize) {
        if self.activated_set.contains(&idx) {
            return;
        }

        let entry = &self.book.entries[idx];
        if !entry.inclusion_group.is_empty() {
            if let Some(&winner_idx) = self.group_winners.get(&entry.inclusion_group) {
                let winner = &self.book.entries[winner_idx];
                // Lower order wins; the incumbent keeps ties.
                if entry.order >= winner.order {
                    debug!(
                        entry = %label(entry),
                        winner = %label(winner),
                        group = %entry.inclusion_group,
                        "lore entry suppressed by inclusion group"
                    );
                    return;
                }
                self.remove(winner_idx);
            }
            self.group_winners.insert(entry.inclusion_group.clone(), idx);
        }

        self.activated.push(idx);
        self.activated_set.insert(idx);
        if entry.recursive {
            self.worklist.push_back((idx, level));
        }
    }

    /// Remove a previously activated entry (it lost its inclusion group),
    /// even if it was triggered via recursion.
    fn remove(&mut self, idx: usize) {
        self.activated.retain(|&i| i != idx);
        self.activated_set.remove(&idx);
        self.worklist.retain(|&(i, _)| i != idx);
    }
}

fn label(entry: &KnowledgeEntry) -> &str {
    if entry.comment.is_empty() {
        &entry.id
    } else {
        &entry.comment
    }
}

/// Full keyword check for one entry against one buffer: probability gate,
/// primary OR-match, then the secondary condition.
fn entry_matches(entry: &KnowledgeEntry, text: &str) -> bool {
    if entry.use_probability && entry.probability < 100 {
        let roll = rand::rng().random_range(1..=100u32);
        if roll > entry.probability as u32 {
            return false;
        }
    }

    let primary = entry
        .keys
        .iter()
        .filter(|k| !k.is_empty())
        .any(|k| keyword_matches(k, text, entry.case_sensitive, entry.match_whole_words));
    if !primary {
        return false;
    }

    let secondary: Vec<&String> = entry
        .secondary_keys
        .iter()
        .filter(|k| !k.is_empty())
        .collect();
    if secondary.is_empty() {
        return true;
    }

    let hit = |k: &str| keyword_matches(k, text, entry.case_sensitive, entry.match_whole_words);
    match entry.selective_logic {
        SecondaryLogic::And => secondary.iter().all(|k| hit(k)),
        SecondaryLogic::Or => secondary.iter().any(|k| hit(k)),
        SecondaryLogic::Not => !secondary.iter().any(|k| hit(k)),
    }
}

/// Single-keyword match honoring case sensitivity and whole-word boundaries.
fn keyword_matches(keyword: &str, text: &str, case_sensitive: bool, whole_words: bool) -> bool {
    if whole_words {
        let pattern = format!(r"\b{}\b", regex::escape(keyword));
        match RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(re) => re.is_match(text),
            Err(_) => false,
        }
    } else if case_sensitive {
        text.contains(keyword)
    } else {
        text.to_lowercase().contains(&keyword.to_lowercase())
    }
}
