//! Engine configuration.
//!
//! [`MemoryConfig`] is a plain value handed to every component constructor
//! as `Arc<MemoryConfig>`. There is no process-wide config store: an admin
//! surface that wants to change limits builds a new config and a new engine.
//!
//! # Examples
//!
//! Defaults everywhere:
//!
//! ```
//! let config = mnemo_rs::config::MemoryConfig::default();
//! assert_eq!(config.session_char_limit, 15_000);
//! ```
//!
//! Builder methods for the common knobs:
//!
//! ```
//! use mnemo_rs::config::MemoryConfig;
//!
//! let config = MemoryConfig::default()
//!     .with_session_char_limit(4_000)
//!     .with_persistent_char_limit(2_000)
//!     .with_summary_model("openai/gpt-4o-mini");
//! assert!(config.validate().is_ok());
//! ```
//!
//! A JSON file only needs the fields it overrides:
//!
//! ```json
//! { "session_char_limit": 8000, "generation_timeout": 45 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::retry::RetryConfig;
use crate::context::MAX_FRAMING_CHARS;
use crate::error::{MemoryError, Result};

/// Template placeholder for the formatted transcript.
pub const CONVERSATION_PLACEHOLDER: &str = "{conversation_text}";
/// Template placeholder for the summary being compacted.
pub const SUMMARY_PLACEHOLDER: &str = "{current_summary}";
/// Template placeholder for the requested reduction, in whole percent.
pub const RATIO_PLACEHOLDER: &str = "{compression_ratio}";

/// System instruction sent with every session summarization.
pub const SUMMARY_SYSTEM_INSTRUCTION: &str =
    "You are a helpful assistant that creates concise, comprehensive conversation summaries.";

/// System instruction sent with every compaction.
pub const COMPRESSION_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant that creates \
concise, comprehensive summaries while preserving ALL important information. Never lose \
personal details, names, dates, or specific facts.";

const DEFAULT_SUMMARY_PROMPT: &str = "\
Please summarize the following conversation between a user and an AI assistant. Focus on:

1. **Personal Information**: Name, job, location, family, friends, interests, preferences
2. **User's Goals & Inquiries**: What they're trying to achieve, questions they've asked
3. **Key Context**: Important facts, decisions made, ongoing projects or topics
4. **Action Items**: Any tasks, follow-ups, or commitments mentioned

Keep the summary concise but comprehensive. Maintain the user's voice and perspective where relevant.

Conversation to summarize:
{conversation_text}

Summary:";

const DEFAULT_COMPRESSION_PROMPT: &str = "\
You are compressing a user's long-term memory profile.
The current profile contains multiple conversation summaries accumulated over time. Create a \
more concise version that preserves ALL critical information.

You must preserve:
1. **Personal Information**: Full name, occupation, company, location, family members, relationships
2. **Goals and Objectives**: Both short-term and long-term goals
3. **Preferences and Patterns**: Communication style, expertise level, working style
4. **Important History**: Key decisions made, major milestones, important context from past conversations
5. **Specific Details**: Any specific names, dates, numbers, or details mentioned

Compression guidelines:
- Merge redundant information
- Maintain chronological context where important
- Preserve the user's voice and terminology
- Aim to reduce by {compression_ratio}% while keeping ALL important facts
- [COMPRESSED ... as of DATE] markers indicate previous compressions

Current profile to compress:
{current_summary}

Compressed profile:";

/// Configuration for the memory engine.
///
/// Every field has a default; see [`Default`] for the values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Transcript size (chars) at which a session is summarized. The
    /// summarizer fires at 90% of this. Default: `15000`.
    pub session_char_limit: usize,
    /// Summary size (chars) at which compaction is considered. Compaction
    /// fires at 90% of this. Default: `8000`.
    pub persistent_char_limit: usize,
    /// Hard ceiling for an assembled prompt. Default: `20000`.
    pub max_prompt_chars: usize,
    /// Maximum retrieved-context chars before truncation. Default: `4000`.
    pub rag_context_char_limit: usize,
    /// Reserve subtracted from the prompt budget; must cover section
    /// headers. Default: `500`.
    pub prompt_safety_buffer: usize,
    /// Target size of a compacted summary relative to its input. Default: `0.6`.
    pub compression_ratio: f64,
    /// Summaries smaller than this are never compacted. Default: `1000`.
    pub min_compaction_size: usize,
    /// Compaction count past which a warning is logged. Not a cap. Default: `3`.
    pub max_compressions: u32,
    /// Summarize automatically when a session nears its limit. Default: `true`.
    pub auto_summary_enabled: bool,
    /// Compact automatically when a summary nears its limit. Default: `true`.
    pub auto_compression_enabled: bool,
    /// Model override for session summarization.
    pub summary_model: Option<String>,
    /// Model override for compaction.
    pub compression_model: Option<String>,
    /// Temperature for both summarization and compaction. Default: `0.3`.
    pub summary_temperature: f32,
    /// Output cap for a session summary. Default: `3200`.
    pub summary_max_output_chars: usize,
    /// Output cap for a compacted summary. Default: `10000`.
    pub compression_max_output_chars: usize,
    /// Timeout for a single generator call, in seconds. Default: `30`.
    #[serde(with = "duration_secs")]
    pub generation_timeout: Duration,
    /// Only the most recent chars of a transcript are summarized. Default: `20000`.
    pub summary_input_char_cap: usize,
    /// Summaries longer than this are truncated before compaction. Default: `50000`.
    pub compression_input_char_cap: usize,
    /// Window during which a repeated disconnect-triggered summarization of an
    /// emptied session is skipped, in seconds. Default: `300`.
    #[serde(with = "duration_secs")]
    pub disconnect_dedup_window: Duration,
    /// Summarization template; must contain `{conversation_text}`.
    pub summary_prompt: String,
    /// Compaction template; must contain `{current_summary}`. May contain
    /// `{compression_ratio}`.
    pub compression_prompt: String,
    /// Busy/locked retry policy for SQLite calls.
    #[serde(skip, default = "RetryConfig::storage")]
    pub storage_retry: RetryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            session_char_limit: 15_000,
            persistent_char_limit: 8_000,
            max_prompt_chars: 20_000,
            rag_context_char_limit: 4_000,
            prompt_safety_buffer: 500,
            compression_ratio: 0.6,
            min_compaction_size: 1_000,
            max_compressions: 3,
            auto_summary_enabled: true,
            auto_compression_enabled: true,
            summary_model: None,
            compression_model: None,
            summary_temperature: 0.3,
            summary_max_output_chars: 3_200,
            compression_max_output_chars: 10_000,
            generation_timeout: Duration::from_secs(30),
            summary_input_char_cap: 20_000,
            compression_input_char_cap: 50_000,
            disconnect_dedup_window: Duration::from_secs(300),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            compression_prompt: DEFAULT_COMPRESSION_PROMPT.to_string(),
            storage_retry: RetryConfig::storage(),
        }
    }
}

impl MemoryConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("session_char_limit", self.session_char_limit),
            ("persistent_char_limit", self.persistent_char_limit),
            ("max_prompt_chars", self.max_prompt_chars),
            ("summary_max_output_chars", self.summary_max_output_chars),
            (
                "compression_max_output_chars",
                self.compression_max_output_chars,
            ),
            ("summary_input_char_cap", self.summary_input_char_cap),
            ("compression_input_char_cap", self.compression_input_char_cap),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(MemoryError::Config(format!("{name} must be greater than zero")));
        }
        if !(self.compression_ratio > 0.0 && self.compression_ratio < 1.0) {
            return Err(MemoryError::Config(format!(
                "compression_ratio must be between 0 and 1 (exclusive), got {}",
                self.compression_ratio
            )));
        }
        if self.prompt_safety_buffer >= self.max_prompt_chars {
            return Err(MemoryError::Config(
                "prompt_safety_buffer must be smaller than max_prompt_chars".into(),
            ));
        }
        if self.prompt_safety_buffer < MAX_FRAMING_CHARS {
            return Err(MemoryError::Config(format!(
                "prompt_safety_buffer must be at least {MAX_FRAMING_CHARS} to cover section headers"
            )));
        }
        if self.generation_timeout.is_zero() {
            return Err(MemoryError::Config(
                "generation_timeout must be greater than zero".into(),
            ));
        }
        if !self.summary_prompt.contains(CONVERSATION_PLACEHOLDER) {
            return Err(MemoryError::Config(format!(
                "summary_prompt must contain {CONVERSATION_PLACEHOLDER}"
            )));
        }
        if !self.compression_prompt.contains(SUMMARY_PLACEHOLDER) {
            return Err(MemoryError::Config(format!(
                "compression_prompt must contain {SUMMARY_PLACEHOLDER}"
            )));
        }
        Ok(())
    }

    /// Transcript size at which auto-summarization fires (90% of the limit).
    pub fn session_trigger_chars(&self) -> usize {
        ninety_percent(self.session_char_limit)
    }

    /// Summary size at which compaction fires (90% of the limit).
    pub fn persistent_trigger_chars(&self) -> usize {
        ninety_percent(self.persistent_char_limit)
    }

    /// Render the summarization template for a formatted transcript.
    pub fn render_summary_prompt(&self, conversation_text: &str) -> String {
        self.summary_prompt
            .replace(CONVERSATION_PLACEHOLDER, conversation_text)
    }

    /// Render the compaction template. The ratio placeholder receives the
    /// requested reduction in whole percent (0.6 target -> "40").
    pub fn render_compression_prompt(&self, current_summary: &str) -> String {
        let reduce_by = ((1.0 - self.compression_ratio) * 100.0).round() as u32;
        self.compression_prompt
            .replace(RATIO_PLACEHOLDER, &reduce_by.to_string())
            .replace(SUMMARY_PLACEHOLDER, current_summary)
    }

    pub fn with_session_char_limit(mut self, limit: usize) -> Self {
        self.session_char_limit = limit;
        self
    }

    pub fn with_persistent_char_limit(mut self, limit: usize) -> Self {
        self.persistent_char_limit = limit;
        self
    }

    pub fn with_max_prompt_chars(mut self, limit: usize) -> Self {
        self.max_prompt_chars = limit;
        self
    }

    pub fn with_rag_context_char_limit(mut self, limit: usize) -> Self {
        self.rag_context_char_limit = limit;
        self
    }

    pub fn with_prompt_safety_buffer(mut self, buffer: usize) -> Self {
        self.prompt_safety_buffer = buffer;
        self
    }

    pub fn with_compression_ratio(mut self, ratio: f64) -> Self {
        self.compression_ratio = ratio;
        self
    }

    pub fn with_min_compaction_size(mut self, size: usize) -> Self {
        self.min_compaction_size = size;
        self
    }

    /// Toggle both automatic summarization and automatic compaction.
    pub fn with_auto(mut self, summary: bool, compression: bool) -> Self {
        self.auto_summary_enabled = summary;
        self.auto_compression_enabled = compression;
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_compression_model(mut self, model: impl Into<String>) -> Self {
        self.compression_model = Some(model.into());
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_storage_retry(mut self, retry: RetryConfig) -> Self {
        self.storage_retry = retry;
        self
    }
}

/// Smallest size that is at least 90% of `limit`.
fn ninety_percent(limit: usize) -> usize {
    limit.saturating_mul(9).div_ceil(10)
}

/// Serialize a [`Duration`] as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MemoryConfig::default();
        assert_eq!(config.session_char_limit, 15_000);
        assert_eq!(config.persistent_char_limit, 8_000);
        assert_eq!(config.max_prompt_chars, 20_000);
        assert_eq!(config.rag_context_char_limit, 4_000);
        assert_eq!(config.prompt_safety_buffer, 500);
        assert!((config.compression_ratio - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.min_compaction_size, 1_000);
        assert_eq!(config.max_compressions, 3);
        assert!(config.auto_summary_enabled);
        assert!(config.auto_compression_enabled);
        assert_eq!(config.generation_timeout, Duration::from_secs(30));
        assert_eq!(config.storage_retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn trigger_thresholds_are_ninety_percent() {
        let config = MemoryConfig::default().with_session_char_limit(100);
        assert_eq!(config.session_trigger_chars(), 90);
        assert_eq!(config.persistent_trigger_chars(), 7_200);
    }

    #[test]
    fn fractional_thresholds_round_up() {
        let config = MemoryConfig::default()
            .with_session_char_limit(15)
            .with_persistent_char_limit(1_005);
        assert_eq!(config.session_trigger_chars(), 14);
        assert_eq!(config.persistent_trigger_chars(), 905);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: MemoryConfig =
            serde_json::from_str(r#"{"session_char_limit": 500, "generation_timeout": 5}"#)
                .unwrap();
        assert_eq!(config.session_char_limit, 500);
        assert_eq!(config.generation_timeout, Duration::from_secs(5));
        assert_eq!(config.persistent_char_limit, 8_000);
        assert_eq!(config.storage_retry, RetryConfig::storage());
    }

    #[test]
    fn from_json_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mnemo.json");
        std::fs::write(&path, r#"{"max_prompt_chars": 12000}"#).unwrap();
        let config = MemoryConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_prompt_chars, 12_000);

        std::fs::write(&path, r#"{"compression_ratio": 1.5}"#).unwrap();
        assert!(matches!(
            MemoryConfig::from_json_file(&path),
            Err(MemoryError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_limits_and_bad_templates() {
        let zero = MemoryConfig::default().with_session_char_limit(0);
        assert!(zero.validate().is_err());

        let no_placeholder = MemoryConfig {
            summary_prompt: "Summarize please".into(),
            ..Default::default()
        };
        assert!(no_placeholder.validate().is_err());

        let huge_buffer = MemoryConfig::default()
            .with_max_prompt_chars(100)
            .with_prompt_safety_buffer(100);
        assert!(huge_buffer.validate().is_err());

        let thin_buffer =
            MemoryConfig::default().with_prompt_safety_buffer(MAX_FRAMING_CHARS - 1);
        assert!(matches!(thin_buffer.validate(), Err(MemoryError::Config(_))));
        let enough = MemoryConfig::default().with_prompt_safety_buffer(MAX_FRAMING_CHARS);
        assert!(enough.validate().is_ok());
    }

    #[test]
    fn storage_retry_stays_out_of_json() {
        let config = MemoryConfig::default().with_storage_retry(RetryConfig::with_retries(7));
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("storage_retry"));
        let back: MemoryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.storage_retry, RetryConfig::storage());
    }

    #[test]
    fn compression_prompt_renders_reduction_percent() {
        let config = MemoryConfig::default();
        let prompt = config.render_compression_prompt("the profile");
        assert!(prompt.contains("reduce by 40%"));
        assert!(prompt.contains("the profile"));
        assert!(!prompt.contains(SUMMARY_PLACEHOLDER));
    }

    #[test]
    fn summary_prompt_renders_transcript() {
        let config = MemoryConfig::default();
        let prompt = config.render_summary_prompt("User: hi\nAssistant: hello");
        assert!(prompt.contains("User: hi\nAssistant: hello"));
        assert!(!prompt.contains(CONVERSATION_PLACEHOLDER));
    }
}
