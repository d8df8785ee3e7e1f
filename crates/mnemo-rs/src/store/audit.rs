//! Append-only audit log of summarizations and compactions.
//!
//! Recording an event never blocks the caller: [`AuditLog::record`] pushes
//! onto an unbounded channel and a background task drains it into SQLite.
//! Delivery is at-least-once: a failed insert is retried a bounded number of
//! times, so a write that succeeded but reported an error can land twice.
//! Events are for observability only; the engine never reads them back.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::Database;

/// Insert attempts per event before it is dropped (on top of the
/// busy/locked retries inside [`Database::with_retry`]).
const WRITE_ATTEMPTS: u32 = 3;

/// A session transcript was folded into the user's summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummarizationEvent {
    pub subject_id: String,
    pub session_id: String,
    pub trigger_reason: String,
    /// Transcript size before summarization.
    pub chars_before: usize,
    /// Length of the summary text that was appended.
    pub chars_after: usize,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

/// A user's summary was compacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionEvent {
    pub subject_id: String,
    pub trigger_reason: String,
    pub chars_before: usize,
    pub chars_after: usize,
    /// Compaction count written into the new marker.
    pub compression_count: u32,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

impl CompressionEvent {
    /// `chars_after / chars_before`, or 1.0 for an empty input.
    pub fn ratio(&self) -> f64 {
        if self.chars_before == 0 {
            1.0
        } else {
            self.chars_after as f64 / self.chars_before as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Summarization(SummarizationEvent),
    Compression(CompressionEvent),
}

impl AuditEvent {
    pub fn subject_id(&self) -> &str {
        match self {
            AuditEvent::Summarization(e) => &e.subject_id,
            AuditEvent::Compression(e) => &e.subject_id,
        }
    }

    /// Insert this event into its audit table.
    pub fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            AuditEvent::Summarization(e) => {
                conn.execute(
                    "INSERT INTO summarization_events
                     (subject_id, session_id, trigger_reason, chars_before, chars_after,
                      model_used, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        e.subject_id,
                        e.session_id,
                        e.trigger_reason,
                        e.chars_before as i64,
                        e.chars_after as i64,
                        e.model_used,
                        e.timestamp,
                    ],
                )?;
            }
            AuditEvent::Compression(e) => {
                conn.execute(
                    "INSERT INTO compression_events
                     (subject_id, trigger_reason, chars_before, chars_after,
                      compression_ratio, compression_count, model_used, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        e.subject_id,
                        e.trigger_reason,
                        e.chars_before as i64,
                        e.chars_after as i64,
                        e.ratio(),
                        e.compression_count,
                        e.model_used,
                        e.timestamp,
                    ],
                )?;
            }
        }
        Ok(())
    }
}

/// Non-blocking handle for recording audit events.
#[derive(Debug, Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditLog {
    /// A log whose events go to the returned receiver instead of SQLite.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A log backed by a background writer task on the current tokio runtime.
    ///
    /// The task exits once every `AuditLog` clone is dropped and the queue
    /// is drained; await the handle to flush before shutdown.
    pub fn spawn_writer(db: Database) -> (Self, JoinHandle<()>) {
        let (log, mut rx) = Self::channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let db = db.clone();
                let written = tokio::task::spawn_blocking(move || write_event(&db, &event)).await;
                if let Err(e) = written {
                    error!(error = %e, "Audit writer task panicked");
                }
            }
            debug!("Audit writer stopped");
        });
        (log, handle)
    }

    /// Enqueue an event. Never blocks and never fails the caller.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(
                subject_id = e.0.subject_id(),
                "Audit writer is gone, event dropped"
            );
        }
    }
}

fn write_event(db: &Database, event: &AuditEvent) {
    for attempt in 1..=WRITE_ATTEMPTS {
        match db.with_retry(|conn| event.insert(conn)) {
            Ok(()) => return,
            Err(e) if attempt < WRITE_ATTEMPTS => {
                warn!(attempt, error = %e, "Audit write failed, retrying");
            }
            Err(e) => {
                error!(
                    subject_id = event.subject_id(),
                    error = %e,
                    "Audit write failed, event dropped"
                );
            }
        }
    }
}

/// Aggregate compaction history for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub total_compressions: u64,
    /// Mean of `chars_after / chars_before`.
    pub avg_compression_ratio: f64,
    pub total_chars_saved: u64,
    pub max_compression_count: u32,
    pub last_compression: Option<DateTime<Utc>>,
}

impl CompressionStats {
    /// Aggregate `compression_events` rows for `user_id`.
    pub fn load(conn: &Connection, user_id: &str) -> rusqlite::Result<Self> {
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(compression_ratio), 0.0),
                    COALESCE(SUM(chars_before - chars_after), 0),
                    COALESCE(MAX(compression_count), 0),
                    MAX(created_at)
             FROM compression_events WHERE subject_id = ?1",
            params![user_id],
            |row| {
                let total: i64 = row.get(0)?;
                let saved: i64 = row.get(2)?;
                Ok(Self {
                    total_compressions: u64::try_from(total).unwrap_or(0),
                    avg_compression_ratio: row.get(1)?,
                    total_chars_saved: u64::try_from(saved).unwrap_or(0),
                    max_compression_count: row.get(3)?,
                    last_compression: row.get(4)?,
                })
            },
        )
    }
}
