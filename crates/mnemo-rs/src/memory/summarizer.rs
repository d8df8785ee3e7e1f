//! Session summarization: drain a transcript into the persistent summary.
//!
//! The transcript is only deleted after its summary has been appended, and
//! only up to the last turn that was summarized. A failed or timed-out
//! generation leaves every turn in place for the next attempt.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Local, Utc};
use tracing::{debug, info, warn};

use super::compactor::Compactor;
use crate::api::generator::{GenerationRequest, TextGenerator, generate_with_timeout};
use crate::config::{MemoryConfig, SUMMARY_SYSTEM_INSTRUCTION};
use crate::context::text::{char_len, tail_chars};
use crate::error::{MemoryError, Result};
use crate::store::{
    AuditEvent, AuditLog, Database, SummarizationEvent, SummaryStore, TranscriptStore, Turn,
};

/// Trigger reason for the size check after each recorded turn.
pub const TRIGGER_AUTO_LIMIT: &str = "auto_limit";
/// Trigger reason for a client disconnect.
pub const TRIGGER_AUTO_DISCONNECT: &str = "auto_disconnect";
/// Trigger reason for an explicit request.
pub const TRIGGER_MANUAL: &str = "manual";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

type SessionKey = (String, String);

/// What a summarization attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// Summary appended and the summarized turns cleared.
    Summarized,
    /// The session had no turns.
    Empty,
    /// Disconnect trigger for a session summarized moments ago.
    SkippedDuplicate,
    /// Another summarization of the same session is running.
    InProgress,
    /// Generation failed or timed out; the transcript is untouched.
    Failed,
}

impl SummarizeOutcome {
    /// Whether the session is in a good state afterwards.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            SummarizeOutcome::Summarized | SummarizeOutcome::Empty | SummarizeOutcome::SkippedDuplicate
        )
    }
}

/// Format turns as `Role: text` lines, oldest first.
pub fn format_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(Turn::as_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Turns session transcripts into summary entries.
#[derive(Clone)]
pub struct Summarizer {
    db: Database,
    generator: Arc<dyn TextGenerator>,
    config: Arc<MemoryConfig>,
    audit: AuditLog,
    compactor: Compactor,
    /// Last successful summarization per session, for disconnect dedup.
    recent: Arc<Mutex<HashMap<SessionKey, Instant>>>,
    in_flight: Arc<Mutex<HashSet<SessionKey>>>,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("model", &self.model())
            .finish_non_exhaustive()
    }
}

impl Summarizer {
    pub fn new(
        db: Database,
        generator: Arc<dyn TextGenerator>,
        config: Arc<MemoryConfig>,
        audit: AuditLog,
        compactor: Compactor,
    ) -> Self {
        Self {
            db,
            generator,
            config,
            audit,
            compactor,
            recent: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Summarize a session. `true` when the session ended up summarized or
    /// had nothing to summarize.
    pub async fn summarize(&self, user_id: &str, session_id: &str, reason: &str) -> Result<bool> {
        Ok(self
            .force_summarize(user_id, session_id, reason)
            .await?
            .is_success())
    }

    /// Summarize a session and report exactly what happened.
    pub async fn force_summarize(
        &self,
        user_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<SummarizeOutcome> {
        let key = (user_id.to_string(), session_id.to_string());
        let Some(_guard) = InFlight::acquire(&self.in_flight, key.clone())? else {
            debug!(user_id, session_id, reason, "Summarization already running");
            return Ok(SummarizeOutcome::InProgress);
        };

        let session = session_id.to_owned();
        let turns = self
            .db
            .call(move |c| TranscriptStore::all_turns(c, &session))
            .await?;
        let Some(last_id) = turns.last().map(|t| t.id) else {
            if reason.contains("disconnect") && self.summarized_recently(&key)? {
                debug!(user_id, session_id, reason, "Duplicate disconnect summarization skipped");
                return Ok(SummarizeOutcome::SkippedDuplicate);
            }
            debug!(user_id, session_id, "Nothing to summarize");
            return Ok(SummarizeOutcome::Empty);
        };

        let chars_before: usize = turns.iter().map(Turn::size_chars).sum();
        let transcript = format_transcript(&turns);
        let cap = self.config.summary_input_char_cap;
        let input = tail_chars(&transcript, cap);
        if input.len() < transcript.len() {
            debug!(
                session_id,
                transcript_chars = char_len(&transcript),
                cap,
                "Summarizing the most recent part of the transcript"
            );
        }

        let request = GenerationRequest {
            system_instruction: SUMMARY_SYSTEM_INSTRUCTION.to_string(),
            user_prompt: self.config.render_summary_prompt(input),
            temperature: self.config.summary_temperature,
            max_output_chars: self.config.summary_max_output_chars,
            model: self.config.summary_model.clone(),
        };
        let summary = match generate_with_timeout(
            self.generator.as_ref(),
            &request,
            self.config.generation_timeout,
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    user_id,
                    session_id,
                    reason,
                    error = %e,
                    "Summarization failed; transcript kept"
                );
                return Ok(SummarizeOutcome::Failed);
            }
        };

        let entry = format!("[{}] {}", Local::now().format(TIMESTAMP_FORMAT), summary);
        let chars_after = char_len(&entry);
        let user = user_id.to_owned();
        self.db
            .call(move |c| SummaryStore::append(c, &user, &entry))
            .await?;

        self.audit
            .record(AuditEvent::Summarization(SummarizationEvent {
                subject_id: user_id.to_string(),
                session_id: session_id.to_string(),
                trigger_reason: reason.to_string(),
                chars_before,
                chars_after,
                model_used: self.model().to_string(),
                timestamp: Utc::now(),
            }));

        let session = session_id.to_owned();
        let cleared = self
            .db
            .call(move |c| TranscriptStore::clear_through(c, &session, last_id))
            .await?;
        self.mark_summarized(key)?;
        info!(
            user_id,
            session_id,
            reason,
            chars_before,
            chars_after,
            turns_cleared = cleared,
            "Session summarized"
        );

        if self.config.auto_compression_enabled {
            if let Err(e) = self.compactor.check_and_compact(user_id).await {
                warn!(user_id, error = %e, "Compaction check after summarization failed");
            }
        }

        Ok(SummarizeOutcome::Summarized)
    }

    fn model(&self) -> &str {
        self.config
            .summary_model
            .as_deref()
            .unwrap_or_else(|| self.generator.model())
    }

    fn summarized_recently(&self, key: &SessionKey) -> Result<bool> {
        let recent = lock(&self.recent)?;
        Ok(recent
            .get(key)
            .is_some_and(|at| at.elapsed() < self.config.disconnect_dedup_window))
    }

    fn mark_summarized(&self, key: SessionKey) -> Result<()> {
        let window = self.config.disconnect_dedup_window;
        let mut recent = lock(&self.recent)?;
        recent.retain(|_, at| at.elapsed() < window);
        recent.insert(key, Instant::now());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MemoryError::Internal("summarizer state lock poisoned".into()))
}

/// Marks a session as being summarized until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<SessionKey>>,
    key: SessionKey,
}

impl<'a> InFlight<'a> {
    /// `None` if the session is already marked.
    fn acquire(set: &'a Mutex<HashSet<SessionKey>>, key: SessionKey) -> Result<Option<Self>> {
        if !lock(set)?.insert(key.clone()) {
            return Ok(None);
        }
        Ok(Some(Self { set, key }))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}
