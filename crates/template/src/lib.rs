//! Macro expansion for prompt templates.
//!
//! Template text may contain placeholders like `{{char}}`, `{{wiBefore}}`,
//! `{{roll:2d6}}`, or `{{random:a,b,c}}`. Expansion resolves them against a
//! [`MacroContext`] — a closed struct enumerating every input a macro can
//! read, so a missing field is a compile error rather than a runtime lookup
//! miss. Expansion is total: it never fails, and unmatched macros are left
//! verbatim.

pub mod context;
pub mod expand;

pub use context::MacroContext;
pub use expand::expand;
