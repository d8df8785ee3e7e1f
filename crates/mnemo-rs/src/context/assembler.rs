//! Budget-aware prompt assembly.
//!
//! [`BudgetAssembler::assemble`] merges four inputs into one prompt:
//!
//! 1. the base prompt, always first and never cut,
//! 2. the user's persistent summary, as a "User Background" block,
//! 3. as many of the most recent transcript lines as fit, as a
//!    "Recent Conversation" block in chronological order,
//! 4. retrieved context, cut to the RAG limit, as a "Relevant Context" block.
//!
//! Only the transcript shrinks to fit. If the fixed parts alone overflow the
//! budget, no transcript lines are included and the result is flagged with
//! `within_limits == false`; assembly itself never fails.

use serde::Serialize;
use tracing::{debug, warn};

use super::budget::{PromptBudget, estimate_tokens};
use super::text::{char_len, truncate_with_notice};

/// Appended to retrieved context that was cut to the RAG limit.
pub const RAG_TRUNCATION_NOTICE: &str = "\n... [RAG context truncated]";

const CONTEXT_HEADER: &str = "\n\nContext about this user:\n\n";
const SECTION_SEPARATOR: &str = "\n\n";
const USER_BACKGROUND_LABEL: &str = "User Background:\n";
const RECENT_CONVERSATION_LABEL: &str = "Recent Conversation:\n";
const RELEVANT_CONTEXT_LABEL: &str = "Relevant Context:\n";

/// Most chars the header, labels, and separators can add on top of the
/// prompt's content. A safety buffer at least this large keeps every
/// assembled prompt within `max_total_chars` whenever the fixed parts fit.
pub const MAX_FRAMING_CHARS: usize = CONTEXT_HEADER.len()
    + 2 * SECTION_SEPARATOR.len()
    + USER_BACKGROUND_LABEL.len()
    + RECENT_CONVERSATION_LABEL.len()
    + RELEVANT_CONTEXT_LABEL.len();

/// Size breakdown of an assembled prompt. All sizes are in chars.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMetrics {
    pub total_chars: usize,
    pub max_total_chars: usize,
    pub base_prompt_chars: usize,
    pub persistent_memory_chars: usize,
    pub session_memory_chars: usize,
    /// Retrieved context after truncation, including the notice.
    pub rag_context_chars: usize,
    pub rag_truncated: bool,
    pub session_lines_included: usize,
    pub session_lines_total: usize,
    pub within_limits: bool,
    pub utilization_percent: f64,
}

impl PromptMetrics {
    /// Estimated tokens for the whole prompt.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(self.total_chars)
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "prompt: {} chars ({:.0}% of {}), ~{} tokens, session lines {}/{}{}",
            self.total_chars,
            self.utilization_percent,
            self.max_total_chars,
            self.estimated_tokens(),
            self.session_lines_included,
            self.session_lines_total,
            if self.within_limits { "" } else { " [OVER BUDGET]" },
        )
    }
}

/// A finished prompt and its metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledPrompt {
    pub prompt: String,
    pub metrics: PromptMetrics,
}

/// Builds prompts under a [`PromptBudget`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetAssembler {
    budget: PromptBudget,
}

impl BudgetAssembler {
    pub fn new(budget: PromptBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &PromptBudget {
        &self.budget
    }

    /// Assemble a prompt. `session_lines_newest_first` are whole transcript
    /// lines, newest first; they are included greedily until the next one
    /// would overflow, and never split.
    pub fn assemble<S: AsRef<str>>(
        &self,
        base_prompt: &str,
        persistent_summary: &str,
        session_lines_newest_first: &[S],
        retrieved_context: &str,
    ) -> AssembledPrompt {
        let (rag, rag_truncated) = truncate_with_notice(
            retrieved_context,
            self.budget.rag_char_limit,
            RAG_TRUNCATION_NOTICE,
        );

        let base_chars = char_len(base_prompt);
        let persistent_chars = char_len(persistent_summary);
        let rag_chars = char_len(&rag);
        let fixed = base_chars + persistent_chars + rag_chars;
        let available = self.budget.available_for_session(fixed);

        let mut included: Vec<&str> = Vec::new();
        let mut included_chars: i64 = 0;
        for line in session_lines_newest_first {
            let line = line.as_ref();
            let cost = char_len(line) as i64 + 1;
            if included_chars + cost > available {
                break;
            }
            included.push(line);
            included_chars += cost;
        }

        let mut session_text = String::new();
        for line in included.iter().rev() {
            session_text.push_str(line);
            session_text.push('\n');
        }

        let mut sections: Vec<String> = Vec::with_capacity(3);
        if !persistent_summary.is_empty() {
            sections.push(format!("{USER_BACKGROUND_LABEL}{persistent_summary}"));
        }
        if !session_text.is_empty() {
            sections.push(format!("{RECENT_CONVERSATION_LABEL}{session_text}"));
        }
        if !rag.is_empty() {
            sections.push(format!("{RELEVANT_CONTEXT_LABEL}{rag}"));
        }

        let prompt = if sections.is_empty() {
            base_prompt.to_string()
        } else {
            format!(
                "{base_prompt}{CONTEXT_HEADER}{}",
                sections.join(SECTION_SEPARATOR)
            )
        };

        let total_chars = char_len(&prompt);
        let max_total = self.budget.max_total_chars;
        let metrics = PromptMetrics {
            total_chars,
            max_total_chars: max_total,
            base_prompt_chars: base_chars,
            persistent_memory_chars: persistent_chars,
            session_memory_chars: char_len(&session_text),
            rag_context_chars: rag_chars,
            rag_truncated,
            session_lines_included: included.len(),
            session_lines_total: session_lines_newest_first.len(),
            within_limits: total_chars <= max_total,
            utilization_percent: total_chars as f64 / max_total.max(1) as f64 * 100.0,
        };

        if metrics.within_limits {
            debug!("{}", metrics.to_log_string());
        } else {
            warn!(
                fixed_chars = fixed,
                available,
                "Prompt exceeds budget: {}",
                metrics.to_log_string()
            );
        }

        AssembledPrompt { prompt, metrics }
    }
}
