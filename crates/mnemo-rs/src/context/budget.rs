//! Prompt budget: the hard character ceiling for an assembled prompt and
//! the carve-outs taken from it.
//!
//! The budget is a plain value supplied per assembly; nothing here is
//! persisted. [`memory_pressure`] is an advisory check that reports when the
//! stored memories are large enough to crowd everything else out of the
//! prompt.

use serde::Serialize;

use crate::config::MemoryConfig;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Space assumed to be taken by the base prompt when judging memory pressure.
const BASE_PROMPT_RESERVE: usize = 2_000;

/// Share of the memory space the persistent summary may take before it is
/// considered too large.
const PERSISTENT_PRESSURE_SHARE: f64 = 0.5;

/// Share of the memory space the session transcript may take before it is
/// considered too large.
const SESSION_PRESSURE_SHARE: f64 = 0.7;

/// Character budget for one assembled prompt.
///
/// The transcript gets `max_total_chars - fixed - safety_buffer`, where
/// `fixed` is the base prompt, the summary, and the (truncated) retrieved
/// context. Section headers are not part of `fixed`, so the safety buffer
/// must cover them (roughly 100 chars) for the assembled prompt to stay
/// within `max_total_chars`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PromptBudget {
    /// Hard ceiling for the assembled prompt.
    pub max_total_chars: usize,
    /// Retrieved context longer than this is truncated.
    pub rag_char_limit: usize,
    /// Reserve held back from the transcript allowance.
    pub safety_buffer: usize,
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self {
            max_total_chars: 20_000,
            rag_char_limit: 4_000,
            safety_buffer: 500,
        }
    }
}

impl PromptBudget {
    pub fn new(max_total_chars: usize, rag_char_limit: usize, safety_buffer: usize) -> Self {
        Self {
            max_total_chars,
            rag_char_limit,
            safety_buffer,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            max_total_chars: config.max_prompt_chars,
            rag_char_limit: config.rag_context_char_limit,
            safety_buffer: config.prompt_safety_buffer,
        }
    }

    /// Characters left for transcript lines once `fixed_chars` are placed.
    /// Negative when the fixed sections alone overflow the budget.
    pub fn available_for_session(&self, fixed_chars: usize) -> i64 {
        self.max_total_chars as i64 - fixed_chars as i64 - self.safety_buffer as i64
    }
}

/// Which memory is crowding the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    PersistentTooLarge,
    SessionTooLarge,
}

impl MemoryPressure {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryPressure::PersistentTooLarge => "persistent_memory_too_large",
            MemoryPressure::SessionTooLarge => "session_memory_too_large",
        }
    }
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report whether stored memory is crowding the prompt.
///
/// Memory may use whatever the budget leaves after the retrieved-context
/// limit and a fixed base-prompt reserve. Only when the two memories
/// together exceed that space is one of them blamed: the summary if it takes
/// more than half, otherwise the transcript if it takes more than 70%.
pub fn memory_pressure(
    budget: &PromptBudget,
    persistent_chars: usize,
    session_chars: usize,
) -> Option<MemoryPressure> {
    let reserved = budget.rag_char_limit + BASE_PROMPT_RESERVE;
    let available = budget.max_total_chars.saturating_sub(reserved) as f64;

    if ((persistent_chars + session_chars) as f64) <= available {
        return None;
    }
    if persistent_chars as f64 > available * PERSISTENT_PRESSURE_SHARE {
        Some(MemoryPressure::PersistentTooLarge)
    } else if session_chars as f64 > available * SESSION_PRESSURE_SHARE {
        Some(MemoryPressure::SessionTooLarge)
    } else {
        None
    }
}

/// Estimated tokens for a character count.
pub fn estimate_tokens(chars: usize) -> usize {
    (chars as f64 / DEFAULT_CHARS_PER_TOKEN) as usize
}
