//! Knowledge base ("worldbook") activation engine.
//!
//! A worldbook is an ordered collection of lore entries, each guarded by
//! keyword rules. Scanning recent conversation history decides which entries
//! enter the prompt and where. The scan is pure over its inputs: entry
//! definitions are never mutated, only an activation set is computed.

pub mod entry;
pub mod scanner;

pub use entry::{KnowledgeBase, KnowledgeEntry, LorePosition, SecondaryLogic};
pub use scanner::scan;
