//! Prompt context: budgets, assembly, and memory pressure.
//!
//! The prompt budget is the hard ceiling every generation call must respect.
//! This module keeps assembled prompts under it:
//!
//! 1. **[`budget`]**: [`PromptBudget`] (total ceiling, RAG carve-out, safety
//!    buffer) and the [`memory_pressure`] advisory.
//!
//! 2. **[`assembler`]**: [`BudgetAssembler`] merges the base prompt, the
//!    persistent summary, recent transcript lines, and retrieved context, and
//!    reports [`PromptMetrics`].
//!
//! 3. **[`text`]**: char-safe length and truncation helpers shared by the
//!    rest of the crate.

pub mod assembler;
pub mod budget;
pub mod text;

// Re-export commonly used items at the module level.
pub use assembler::{
    AssembledPrompt, BudgetAssembler, MAX_FRAMING_CHARS, PromptMetrics, RAG_TRUNCATION_NOTICE,
};
pub use budget::{DEFAULT_CHARS_PER_TOKEN, MemoryPressure, PromptBudget, memory_pressure};
