//! Summary compaction.
//!
//! When a user's summary nears its limit it is re-summarized into a shorter
//! one. Generation is slow and can fail, and the summary can be appended to
//! while it runs, so the replace is guarded:
//!
//! 1. Snapshot the current summary as the backup.
//! 2. Generate the compacted text and validate it.
//! 3. Prefix a [`CompressionMarker`] with the new count.
//! 4. Replace the stored summary only if it still equals the backup
//!    ([`SummaryStore::replace_if_unchanged`]).
//! 5. If the storage call itself fails and our write had landed, write the
//!    backup back, then return the storage error.
//!
//! A generation failure, a validation failure, and a concurrent change all
//! end with `Ok(false)` and the stored summary untouched.

use std::sync::Arc;

use chrono::{Local, Utc};
use tracing::{debug, error, info, warn};

use super::marker::CompressionMarker;
use crate::api::generator::{GenerationRequest, TextGenerator, generate_with_timeout};
use crate::config::{COMPRESSION_SYSTEM_INSTRUCTION, MemoryConfig};
use crate::context::text::{char_len, truncate_with_notice};
use crate::error::Result;
use crate::store::{AuditEvent, AuditLog, CompressionEvent, Database, ReplaceOutcome, SummaryStore};

/// Trigger reason recorded for threshold-driven compactions.
pub const TRIGGER_SIZE_LIMIT: &str = "size_limit";
/// Trigger reason recorded for [`Compactor::compact_now`].
pub const TRIGGER_MANUAL: &str = "manual";

/// Compacted text shorter than this is rejected.
const MIN_COMPACTED_CHARS: usize = 10;

/// Compacted text shorter than this share of the backup is suspicious but kept.
const AGGRESSIVE_COMPACTION_SHARE: f64 = 0.1;

/// Appended to a summary that was cut before being sent for compaction.
const INPUT_TRUNCATION_NOTICE: &str = "\n\n[TRUNCATED DUE TO LENGTH]";

/// Shrinks over-large summaries.
#[derive(Clone)]
pub struct Compactor {
    db: Database,
    generator: Arc<dyn TextGenerator>,
    config: Arc<MemoryConfig>,
    audit: AuditLog,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("model", &self.model())
            .finish_non_exhaustive()
    }
}

impl Compactor {
    pub fn new(
        db: Database,
        generator: Arc<dyn TextGenerator>,
        config: Arc<MemoryConfig>,
        audit: AuditLog,
    ) -> Self {
        Self {
            db,
            generator,
            config,
            audit,
        }
    }

    /// Compact the user's summary if it has reached 90% of the persistent
    /// limit. Returns whether a compaction was committed.
    pub async fn check_and_compact(&self, user_id: &str) -> Result<bool> {
        self.compact(user_id, TRIGGER_SIZE_LIMIT, false).await
    }

    /// Compact regardless of the 90% threshold. The minimum-size floor still
    /// applies.
    pub async fn compact_now(&self, user_id: &str) -> Result<bool> {
        self.compact(user_id, TRIGGER_MANUAL, true).await
    }

    fn model(&self) -> &str {
        self.config
            .compression_model
            .as_deref()
            .unwrap_or_else(|| self.generator.model())
    }

    async fn compact(&self, user_id: &str, reason: &str, ignore_threshold: bool) -> Result<bool> {
        let user = user_id.to_owned();
        let Some(backup) = self.db.call(move |c| SummaryStore::get(c, &user)).await? else {
            debug!(user_id, "No summary to compact");
            return Ok(false);
        };
        let size = char_len(&backup);

        let trigger = self.config.persistent_trigger_chars();
        if !ignore_threshold && size < trigger {
            debug!(user_id, size, trigger, "Summary below compaction threshold");
            return Ok(false);
        }
        if size < self.config.min_compaction_size {
            debug!(
                user_id,
                size,
                min = self.config.min_compaction_size,
                "Summary too small to compact"
            );
            return Ok(false);
        }

        let prior_count = CompressionMarker::parse_count(&backup);
        if prior_count >= self.config.max_compressions {
            warn!(
                user_id,
                prior_count,
                max = self.config.max_compressions,
                "Summary has been compacted many times; detail loss accumulates"
            );
        }

        let compacted = match self.generate(user_id, &backup, size).await {
            Some(text) => text,
            None => return Ok(false),
        };

        let new_count = prior_count + 1;
        let new_text = format!(
            "{}\n\n{}",
            CompressionMarker::render(new_count, Local::now()),
            compacted
        );
        let chars_after = char_len(&new_text);

        let (user, expected, written) = (user_id.to_owned(), backup.clone(), new_text.clone());
        let outcome = self
            .db
            .call(move |c| SummaryStore::replace_if_unchanged(c, &user, &expected, &written))
            .await;

        match outcome {
            Ok(ReplaceOutcome::Replaced) => {
                self.audit.record(AuditEvent::Compression(CompressionEvent {
                    subject_id: user_id.to_string(),
                    trigger_reason: reason.to_string(),
                    chars_before: size,
                    chars_after,
                    compression_count: new_count,
                    model_used: self.model().to_string(),
                    timestamp: Utc::now(),
                }));
                info!(
                    user_id,
                    chars_before = size,
                    chars_after,
                    compression_count = new_count,
                    reason,
                    "Summary compacted"
                );
                Ok(true)
            }
            Ok(ReplaceOutcome::Conflict) => {
                warn!(
                    user_id,
                    "Summary changed during compaction; keeping the newer value"
                );
                Ok(false)
            }
            Ok(ReplaceOutcome::VerifyFailed) => {
                warn!(user_id, "Compacted summary did not read back; rolled back");
                Ok(false)
            }
            Err(e) => {
                warn!(user_id, error = %e, "Compaction replace failed; checking stored summary");
                match self.restore_backup(user_id, &backup, &new_text).await {
                    Ok(true) => warn!(user_id, "Backup summary restored after failed compaction"),
                    Ok(false) => {}
                    Err(restore_err) => error!(
                        user_id,
                        error = %restore_err,
                        backup_chars = size,
                        "CRITICAL: could not verify or restore summary after failed compaction"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Generate and validate the compacted text. `None` means the stored
    /// summary must stay as it is.
    async fn generate(&self, user_id: &str, backup: &str, size: usize) -> Option<String> {
        let cap = self.config.compression_input_char_cap;
        let (input, truncated) = truncate_with_notice(backup, cap, INPUT_TRUNCATION_NOTICE);
        if truncated {
            warn!(user_id, size, cap, "Summary truncated before compaction");
        }

        let request = GenerationRequest {
            system_instruction: COMPRESSION_SYSTEM_INSTRUCTION.to_string(),
            user_prompt: self.config.render_compression_prompt(&input),
            temperature: self.config.summary_temperature,
            max_output_chars: self.config.compression_max_output_chars,
            model: self.config.compression_model.clone(),
        };

        let compacted = match generate_with_timeout(
            self.generator.as_ref(),
            &request,
            self.config.generation_timeout,
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(user_id, error = %e, "Compaction generation failed; summary kept");
                return None;
            }
        };

        let compacted_chars = char_len(&compacted);
        if compacted_chars < MIN_COMPACTED_CHARS {
            warn!(
                user_id,
                compacted_chars, "Compacted summary too short; summary kept"
            );
            return None;
        }
        if (compacted_chars as f64) < size as f64 * AGGRESSIVE_COMPACTION_SHARE {
            warn!(
                user_id,
                chars_before = size,
                compacted_chars,
                "Compaction looks too aggressive; keeping it anyway"
            );
        }
        Some(compacted)
    }

    /// Write `backup` back if the stored summary is `written`. Any other
    /// value belongs to another writer and is left alone. Returns whether
    /// the backup was written.
    async fn restore_backup(&self, user_id: &str, backup: &str, written: &str) -> Result<bool> {
        let (user, backup, written) = (user_id.to_owned(), backup.to_owned(), written.to_owned());
        self.db
            .call(move |c| match SummaryStore::get(c, &user)? {
                Some(current) if current == written => {
                    SummaryStore::put(c, &user, &backup)?;
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::generator::GenerateFuture;
    use crate::api::retry::RetryConfig;
    use crate::error::{GenerationError, MemoryError};
    use std::sync::Mutex;

    /// Returns queued responses in order, recording every prompt.
    struct Scripted {
        responses: Mutex<Vec<std::result::Result<String, GenerationError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(responses: Vec<std::result::Result<String, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    impl TextGenerator for Scripted {
        fn generate<'a>(&'a self, request: &'a GenerationRequest) -> GenerateFuture<'a> {
            self.prompts.lock().unwrap().push(request.user_prompt.clone());
            let mut queue = self.responses.lock().unwrap();
            let next = if queue.is_empty() {
                Err(GenerationError::Failed("script exhausted".into()))
            } else {
                queue.remove(0)
            };
            Box::pin(async move { next })
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn setup(
        generator: Arc<Scripted>,
        config: MemoryConfig,
    ) -> (
        Compactor,
        Database,
        tokio::sync::mpsc::UnboundedReceiver<AuditEvent>,
    ) {
        let db = Database::open_in_memory(RetryConfig::storage()).unwrap();
        let (audit, rx) = AuditLog::channel();
        let compactor = Compactor::new(db.clone(), generator, Arc::new(config), audit);
        (compactor, db, rx)
    }

    fn small_limits() -> MemoryConfig {
        MemoryConfig::default()
            .with_persistent_char_limit(1_000)
            .with_min_compaction_size(100)
    }

    fn stored(db: &Database, user: &str) -> Option<String> {
        db.with_retry(|c| SummaryStore::get(c, user)).unwrap()
    }

    fn block_summary_updates(db: &Database) {
        db.with_retry(|c| {
            c.execute_batch(
                "CREATE TRIGGER block_summary_updates BEFORE UPDATE ON summaries
                 BEGIN SELECT RAISE(ABORT, 'summaries are read-only'); END;",
            )
        })
        .unwrap();
    }

    #[tokio::test]
    async fn below_threshold_is_a_noop() {
        let generator = Scripted::new(vec![Ok("should not be used".into())]);
        let (compactor, db, _rx) = setup(generator.clone(), small_limits());
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(899)))
            .unwrap();

        assert!(!compactor.check_and_compact("u1").await.unwrap());
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn minimum_size_floor_applies_even_when_forced() {
        let generator = Scripted::new(vec![Ok("should not be used".into())]);
        let config = small_limits().with_min_compaction_size(5_000);
        let (compactor, db, _rx) = setup(generator.clone(), config);
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(950)))
            .unwrap();

        assert!(!compactor.check_and_compact("u1").await.unwrap());
        assert!(!compactor.compact_now("u1").await.unwrap());
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_compaction_adds_first_marker_and_audits() {
        let generator = Scripted::new(vec![Ok("compact profile text".into())]);
        let (compactor, db, mut rx) = setup(generator.clone(), small_limits());
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(950)))
            .unwrap();

        assert!(compactor.check_and_compact("u1").await.unwrap());

        let text = stored(&db, "u1").unwrap();
        assert!(text.starts_with("[COMPRESSED SUMMARY as of "));
        assert!(text.ends_with("\n\ncompact profile text"));
        assert_eq!(CompressionMarker::parse_count(&text), 1);

        match rx.try_recv().unwrap() {
            AuditEvent::Compression(e) => {
                assert_eq!(e.chars_before, 950);
                assert_eq!(e.chars_after, char_len(&text));
                assert_eq!(e.compression_count, 1);
                assert_eq!(e.trigger_reason, TRIGGER_SIZE_LIMIT);
                assert_eq!(e.model_used, "scripted");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn count_increments_from_existing_marker() {
        let generator = Scripted::new(vec![Ok("smaller again".into())]);
        let (compactor, db, _rx) = setup(generator, small_limits());
        let existing = format!(
            "[COMPRESSED 3x as of 2024-01-01 00:00]\n\n{}",
            "b".repeat(950)
        );
        db.with_retry(|c| SummaryStore::put(c, "u1", &existing))
            .unwrap();

        assert!(compactor.check_and_compact("u1").await.unwrap());
        let text = stored(&db, "u1").unwrap();
        assert!(text.starts_with("[COMPRESSED 4x as of "));
    }

    #[tokio::test]
    async fn generation_failure_keeps_summary() {
        let generator = Scripted::new(vec![Err(GenerationError::Failed("HTTP 503".into()))]);
        let (compactor, db, mut rx) = setup(generator, small_limits());
        let original = "a".repeat(950);
        db.with_retry(|c| SummaryStore::put(c, "u1", &original))
            .unwrap();

        assert!(!compactor.check_and_compact("u1").await.unwrap());
        assert_eq!(stored(&db, "u1").as_deref(), Some(original.as_str()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn too_short_result_is_rejected() {
        let generator = Scripted::new(vec![Ok("tiny".into())]);
        let (compactor, db, _rx) = setup(generator, small_limits());
        let original = "a".repeat(950);
        db.with_retry(|c| SummaryStore::put(c, "u1", &original))
            .unwrap();

        assert!(!compactor.check_and_compact("u1").await.unwrap());
        assert_eq!(stored(&db, "u1").as_deref(), Some(original.as_str()));
    }

    #[tokio::test]
    async fn aggressive_but_valid_result_is_kept() {
        // 20 chars from 950 is under 10%, but at least 10 chars.
        let generator = Scripted::new(vec![Ok("twenty chars exactly".into())]);
        let (compactor, db, _rx) = setup(generator, small_limits());
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(950)))
            .unwrap();

        assert!(compactor.check_and_compact("u1").await.unwrap());
        assert!(stored(&db, "u1").unwrap().ends_with("twenty chars exactly"));
    }

    #[tokio::test]
    async fn compact_now_skips_threshold() {
        let generator = Scripted::new(vec![Ok("manually compacted".into())]);
        let (compactor, db, mut rx) = setup(generator, small_limits());
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(500)))
            .unwrap();

        assert!(compactor.compact_now("u1").await.unwrap());
        match rx.try_recv().unwrap() {
            AuditEvent::Compression(e) => assert_eq!(e.trigger_reason, TRIGGER_MANUAL),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_input_is_truncated_for_the_prompt() {
        let generator = Scripted::new(vec![Ok("compacted text here".into())]);
        let config = small_limits();
        let config = MemoryConfig {
            compression_input_char_cap: 2_000,
            ..config
        };
        let (compactor, db, _rx) = setup(generator.clone(), config);
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(3_000)))
            .unwrap();

        assert!(compactor.check_and_compact("u1").await.unwrap());
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("[TRUNCATED DUE TO LENGTH]"));
        assert!(!prompts[0].contains(&"a".repeat(2_001)));
    }

    #[tokio::test]
    async fn model_override_and_ratio_reach_the_request() {
        let generator = Scripted::new(vec![Ok("compacted by override".into())]);
        let config = small_limits()
            .with_compression_model("cheap/model")
            .with_compression_ratio(0.5);
        let (compactor, db, mut rx) = setup(generator.clone(), config);
        db.with_retry(|c| SummaryStore::put(c, "u1", &"a".repeat(950)))
            .unwrap();

        assert!(compactor.check_and_compact("u1").await.unwrap());
        assert!(generator.prompts.lock().unwrap()[0].contains("50%"));
        match rx.try_recv().unwrap() {
            AuditEvent::Compression(e) => assert_eq!(e.model_used, "cheap/model"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_summary_is_a_noop() {
        let generator = Scripted::new(vec![]);
        let (compactor, _db, _rx) = setup(generator, small_limits());
        assert!(!compactor.compact_now("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn storage_failure_during_replace_keeps_backup_and_errors() {
        let generator = Scripted::new(vec![Ok("compact profile text".into())]);
        let (compactor, db, mut rx) = setup(generator, small_limits());
        let original = "a".repeat(950);
        db.with_retry(|c| SummaryStore::put(c, "u1", &original))
            .unwrap();
        block_summary_updates(&db);

        let result = compactor.check_and_compact("u1").await;
        assert!(matches!(result, Err(MemoryError::Storage(_))));
        assert_eq!(stored(&db, "u1").as_deref(), Some(original.as_str()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_that_does_not_read_back_is_rolled_back() {
        let generator = Scripted::new(vec![Ok("compact profile text".into())]);
        let (compactor, db, mut rx) = setup(generator, small_limits());
        let original = "a".repeat(950);
        db.with_retry(|c| SummaryStore::put(c, "u1", &original))
            .unwrap();
        db.with_retry(|c| {
            c.execute_batch(
                "CREATE TRIGGER mangle_compacted AFTER UPDATE ON summaries
                 WHEN NEW.text LIKE '[COMPRESSED%'
                 BEGIN UPDATE summaries SET text = text || '!' WHERE user_id = NEW.user_id; END;",
            )
        })
        .unwrap();

        assert!(!compactor.check_and_compact("u1").await.unwrap());
        assert_eq!(stored(&db, "u1").as_deref(), Some(original.as_str()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restore_writes_backup_over_our_own_write_only() {
        let (compactor, db, _rx) = setup(Scripted::new(vec![]), small_limits());

        db.with_retry(|c| SummaryStore::put(c, "u1", "compacted"))
            .unwrap();
        assert!(compactor
            .restore_backup("u1", "full backup", "compacted")
            .await
            .unwrap());
        assert_eq!(stored(&db, "u1").as_deref(), Some("full backup"));

        db.with_retry(|c| SummaryStore::put(c, "u2", "newer value"))
            .unwrap();
        assert!(!compactor
            .restore_backup("u2", "full backup", "compacted")
            .await
            .unwrap());
        assert_eq!(stored(&db, "u2").as_deref(), Some("newer value"));
    }

    #[tokio::test]
    async fn failed_restore_reports_the_storage_error() {
        let (compactor, db, _rx) = setup(Scripted::new(vec![]), small_limits());
        db.with_retry(|c| SummaryStore::put(c, "u1", "compacted"))
            .unwrap();
        block_summary_updates(&db);

        let result = compactor
            .restore_backup("u1", "full backup", "compacted")
            .await;
        assert!(matches!(result, Err(MemoryError::Storage(_))));
        assert_eq!(stored(&db, "u1").as_deref(), Some("compacted"));
    }
}
