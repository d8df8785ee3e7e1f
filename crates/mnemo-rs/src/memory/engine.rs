//! [`MemoryEngine`]: the entry point tying the stores, the summarizer, the
//! compactor, and the assembler together.
//!
//! ```text
//! record_turn ──► transcript ──(≥ 90% of session limit)──► Summarizer
//!                                                              │
//!                                             summary ◄────────┘
//!                                                │
//!                              (≥ 90% of persistent limit)──► Compactor
//!
//! build_prompt ◄── summary + recent turns + retrieved context
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::compactor::Compactor;
use super::summarizer::{SummarizeOutcome, Summarizer, TRIGGER_AUTO_LIMIT};
use crate::api::generator::TextGenerator;
use crate::config::MemoryConfig;
use crate::context::{
    AssembledPrompt, BudgetAssembler, MemoryPressure, PromptBudget, memory_pressure,
};
use crate::error::Result;
use crate::store::{
    AuditLog, CompressionStats, Database, SummaryStore, TranscriptStore, Turn, TurnRole,
};

/// Result of [`MemoryEngine::record_turn`].
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecorded {
    pub turn: Turn,
    /// Transcript size after the turn and any summarization it triggered.
    pub session_chars: usize,
    /// Set when the turn pushed the session over its trigger.
    pub summarization: Option<SummarizeOutcome>,
}

/// Memory usage of one user and session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub session_chars: usize,
    pub session_limit: usize,
    pub session_usage_percent: f64,
    pub persistent_chars: usize,
    pub persistent_limit: usize,
    pub has_summary: bool,
}

/// Bounded conversational memory for many users and sessions.
///
/// Cloning is cheap; clones share the database, the generator, and the
/// summarizer's in-memory state.
///
/// The `async` methods run their storage work on tokio's blocking pool. The
/// plain ones query SQLite on the calling thread.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    db: Database,
    config: Arc<MemoryConfig>,
    assembler: BudgetAssembler,
    summarizer: Summarizer,
    compactor: Compactor,
}

impl MemoryEngine {
    pub fn new(
        db: Database,
        generator: Arc<dyn TextGenerator>,
        config: Arc<MemoryConfig>,
        audit: AuditLog,
    ) -> Self {
        let compactor = Compactor::new(db.clone(), generator.clone(), config.clone(), audit.clone());
        let summarizer = Summarizer::new(
            db.clone(),
            generator,
            config.clone(),
            audit,
            compactor.clone(),
        );
        Self {
            assembler: BudgetAssembler::new(PromptBudget::from_config(&config)),
            db,
            config,
            summarizer,
            compactor,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ── Turns ──────────────────────────────────────────────────────

    /// Append a turn, then summarize the session if it reached 90% of the
    /// session limit and auto-summary is enabled.
    ///
    /// A failed summarization is not an error; it shows up in
    /// [`TurnRecorded::summarization`] and is retried on the next turn.
    pub async fn record_turn(
        &self,
        user_id: &str,
        session_id: &str,
        role: TurnRole,
        text: &str,
    ) -> Result<TurnRecorded> {
        let (user, session, text) = (user_id.to_owned(), session_id.to_owned(), text.to_owned());
        let turn = self
            .db
            .call(move |c| TranscriptStore::append(c, &user, &session, role, &text))
            .await?;
        let size = self.session_size(session_id).await?;

        let trigger = self.config.session_trigger_chars();
        if !self.config.auto_summary_enabled || size < trigger {
            debug!(session_id, size, trigger, "Turn recorded");
            return Ok(TurnRecorded {
                turn,
                session_chars: size,
                summarization: None,
            });
        }

        info!(
            user_id,
            session_id,
            size,
            limit = self.config.session_char_limit,
            "Session near limit, summarizing"
        );
        let outcome = self
            .summarizer
            .force_summarize(user_id, session_id, TRIGGER_AUTO_LIMIT)
            .await?;
        let session_chars = self.session_size(session_id).await?;
        Ok(TurnRecorded {
            turn,
            session_chars,
            summarization: Some(outcome),
        })
    }

    async fn session_size(&self, session_id: &str) -> Result<usize> {
        let session = session_id.to_owned();
        self.db
            .call(move |c| TranscriptStore::size(c, &session))
            .await
    }

    /// Turns of a session, oldest first.
    pub fn transcript(&self, session_id: &str) -> Result<Vec<Turn>> {
        self.db
            .with_retry(|c| TranscriptStore::all_turns(c, session_id))
    }

    /// Delete every turn of a session without summarizing it.
    pub fn clear_session(&self, session_id: &str) -> Result<usize> {
        let removed = self
            .db
            .with_retry(|c| TranscriptStore::clear(c, session_id))?;
        info!(session_id, removed, "Session cleared");
        Ok(removed)
    }

    // ── Summary ────────────────────────────────────────────────────

    pub fn get_summary(&self, user_id: &str) -> Result<Option<String>> {
        self.db.with_retry(|c| SummaryStore::get(c, user_id))
    }

    /// Delete the user's summary. Returns whether one existed.
    pub fn clear_summary(&self, user_id: &str) -> Result<bool> {
        let removed = self.db.with_retry(|c| SummaryStore::clear(c, user_id))?;
        info!(user_id, removed, "Summary cleared");
        Ok(removed)
    }

    /// Summarize a session now. See [`Summarizer::summarize`].
    pub async fn summarize(&self, user_id: &str, session_id: &str, reason: &str) -> Result<bool> {
        self.summarizer.summarize(user_id, session_id, reason).await
    }

    /// Summarize a session now and report the outcome. A reason containing
    /// `disconnect` is skipped when the session is empty and was summarized
    /// within the dedup window.
    pub async fn force_summarize(
        &self,
        user_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<SummarizeOutcome> {
        self.summarizer
            .force_summarize(user_id, session_id, reason)
            .await
    }

    /// Compact the summary if it reached 90% of the persistent limit.
    pub async fn check_and_compact(&self, user_id: &str) -> Result<bool> {
        self.compactor.check_and_compact(user_id).await
    }

    /// Compact the summary regardless of the threshold.
    pub async fn compact_now(&self, user_id: &str) -> Result<bool> {
        self.compactor.compact_now(user_id).await
    }

    // ── Prompt ─────────────────────────────────────────────────────

    /// Build the bounded prompt for the next generation call in a session.
    pub fn build_prompt(
        &self,
        user_id: &str,
        session_id: &str,
        base_prompt: &str,
        retrieved_context: &str,
    ) -> Result<AssembledPrompt> {
        let summary = self.get_summary(user_id)?.unwrap_or_default();
        let turns = self.transcript(session_id)?;
        let lines: Vec<String> = turns.iter().rev().map(Turn::as_line).collect();
        Ok(self
            .assembler
            .assemble(base_prompt, &summary, &lines, retrieved_context))
    }

    // ── Stats ──────────────────────────────────────────────────────

    pub fn memory_stats(&self, user_id: &str, session_id: &str) -> Result<MemoryStats> {
        let session_chars = self
            .db
            .with_retry(|c| TranscriptStore::size(c, session_id))?;
        let summary = self.get_summary(user_id)?;
        let limit = self.config.session_char_limit;
        Ok(MemoryStats {
            session_chars,
            session_limit: limit,
            session_usage_percent: session_chars as f64 / limit.max(1) as f64 * 100.0,
            persistent_chars: summary.as_deref().map_or(0, |s| s.chars().count()),
            persistent_limit: self.config.persistent_char_limit,
            has_summary: summary.is_some(),
        })
    }

    /// Compaction history aggregated from the audit table.
    pub fn compression_stats(&self, user_id: &str) -> Result<CompressionStats> {
        self.db
            .with_retry(|c| CompressionStats::load(c, user_id))
    }

    /// Which memory, if any, is crowding the prompt budget.
    pub fn memory_pressure(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<MemoryPressure>> {
        let stats = self.memory_stats(user_id, session_id)?;
        Ok(memory_pressure(
            self.assembler.budget(),
            stats.persistent_chars,
            stats.session_chars,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::generator::{GenerateFuture, GenerationRequest};
    use crate::api::retry::RetryConfig;

    struct Echo;

    impl TextGenerator for Echo {
        fn generate<'a>(&'a self, _request: &'a GenerationRequest) -> GenerateFuture<'a> {
            Box::pin(async {
                Ok::<_, crate::error::GenerationError>("User shared some facts.".to_string())
            })
        }

        fn model(&self) -> &str {
            "echo"
        }
    }

    fn engine(config: MemoryConfig) -> MemoryEngine {
        let db = Database::open_in_memory(RetryConfig::storage()).unwrap();
        let (audit, _rx) = AuditLog::channel();
        MemoryEngine::new(db, Arc::new(Echo), Arc::new(config), audit)
    }

    #[tokio::test]
    async fn turn_below_trigger_does_not_summarize() {
        let engine = engine(MemoryConfig::default().with_session_char_limit(1_000));
        let recorded = engine
            .record_turn("u1", "s1", TurnRole::User, "hello")
            .await
            .unwrap();
        assert_eq!(recorded.summarization, None);
        assert_eq!(recorded.session_chars, 4 + 5 + 4);
    }

    #[tokio::test]
    async fn trigger_requires_a_full_ninety_percent() {
        let engine = engine(MemoryConfig::default().with_session_char_limit(15));
        let below = engine
            .record_turn("u1", "s1", TurnRole::User, "hello")
            .await
            .unwrap();
        assert_eq!(below.session_chars, 13);
        assert_eq!(below.summarization, None);

        let at = engine
            .record_turn("u2", "s2", TurnRole::User, "hello!")
            .await
            .unwrap();
        assert_eq!(at.summarization, Some(SummarizeOutcome::Summarized));
        assert_eq!(at.session_chars, 0);
    }

    #[tokio::test]
    async fn auto_summary_can_be_disabled() {
        let config = MemoryConfig::default()
            .with_session_char_limit(100)
            .with_auto(false, true);
        let engine = engine(config);
        for _ in 0..3 {
            engine
                .record_turn("u1", "s1", TurnRole::User, &"x".repeat(60))
                .await
                .unwrap();
        }
        assert_eq!(engine.transcript("s1").unwrap().len(), 3);
        assert!(engine.get_summary("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn prompt_includes_summary_and_recent_turns() {
        let engine = engine(MemoryConfig::default());
        engine
            .record_turn("u1", "s1", TurnRole::User, "What's the weather?")
            .await
            .unwrap();
        engine
            .record_turn("u1", "s1", TurnRole::Assistant, "Sunny.")
            .await
            .unwrap();
        assert!(engine.summarize("u1", "s1", "manual").await.unwrap());
        engine
            .record_turn("u1", "s1", TurnRole::User, "Thanks!")
            .await
            .unwrap();

        let out = engine
            .build_prompt("u1", "s1", "You are helpful.", "doc")
            .unwrap();
        assert!(out.prompt.starts_with("You are helpful."));
        assert!(out.prompt.contains("User Background:\n["));
        assert!(out.prompt.contains("Recent Conversation:\nUser: Thanks!\n"));
        assert!(out.prompt.contains("Relevant Context:\ndoc"));
        assert_eq!(out.metrics.session_lines_total, 1);
    }

    #[tokio::test]
    async fn stats_report_usage() {
        let engine = engine(MemoryConfig::default().with_session_char_limit(1_000));
        engine
            .record_turn("u1", "s1", TurnRole::User, &"x".repeat(92))
            .await
            .unwrap();
        let stats = engine.memory_stats("u1", "s1").unwrap();
        assert_eq!(stats.session_chars, 100);
        assert!((stats.session_usage_percent - 10.0).abs() < f64::EPSILON);
        assert!(!stats.has_summary);
        assert_eq!(stats.persistent_chars, 0);
        assert_eq!(engine.memory_pressure("u1", "s1").unwrap(), None);
    }

    #[tokio::test]
    async fn clear_operations_remove_state() {
        let engine = engine(MemoryConfig::default());
        engine
            .record_turn("u1", "s1", TurnRole::User, "hello")
            .await
            .unwrap();
        assert!(engine.summarize("u1", "s1", "manual").await.unwrap());
        engine
            .record_turn("u1", "s1", TurnRole::User, "again")
            .await
            .unwrap();

        assert_eq!(engine.clear_session("s1").unwrap(), 1);
        assert!(engine.clear_summary("u1").unwrap());
        assert!(!engine.clear_summary("u1").unwrap());
        assert!(engine.get_summary("u1").unwrap().is_none());
    }
}
