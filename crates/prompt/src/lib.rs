//! Preset-driven prompt assembly.
//!
//! A preset is an ordered set of template entries plus generation
//! parameters. Assembly runs the lore scanner over the knowledge base,
//! expands each entry's macros, and produces the pre-history and
//! post-history prompt blocks plus any depth-based history injections.

pub mod assemble;
pub mod preset;

pub use assemble::{AssembledPrompt, DepthInjection, assemble, inject_depth_entries};
pub use preset::{Preset, SlotPosition, TemplateEntry};
