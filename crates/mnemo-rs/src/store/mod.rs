//! SQLite persistence.
//!
//! [`Database`] owns the connection and the busy/locked retry policy. The
//! repositories ([`TranscriptStore`], [`SummaryStore`], and the audit writer)
//! are stateless: every method takes a `&Connection` and returns a plain
//! `rusqlite::Result`, and callers run them through [`Database::with_retry`].
//!
//! ```ignore
//! let db = Database::open_in_memory(RetryConfig::storage())?;
//! db.with_retry(|conn| TranscriptStore::append(conn, "u1", "s1", TurnRole::User, "hi"))?;
//! let size = db.with_retry(|conn| TranscriptStore::size(conn, "s1"))?;
//! ```

pub mod audit;
pub mod summary;
pub mod transcript;

pub use audit::{AuditEvent, AuditLog, CompressionEvent, CompressionStats, SummarizationEvent};
pub use summary::{ReplaceOutcome, Summary, SummaryStore};
pub use transcript::{TURN_OVERHEAD_CHARS, Turn, TurnRole, TranscriptStore};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::api::retry::RetryConfig;
use crate::error::{MemoryError, Result};

/// How long SQLite itself waits on a lock before reporting `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Shared handle to the engine's SQLite database.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) a database file, enable WAL, and run migrations.
    pub fn open(path: impl AsRef<Path>, retry: RetryConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        debug!(path = %path.display(), "Opened memory database");
        Self::from_connection(conn, retry)
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory(retry: RetryConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, retry)
    }

    fn from_connection(conn: Connection, retry: RetryConfig) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry,
        })
    }

    /// The retry policy applied by [`with_retry`](Self::with_retry).
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `op` against the connection, retrying `SQLITE_BUSY` and
    /// `SQLITE_LOCKED` failures with backoff.
    ///
    /// Other errors are returned immediately as [`MemoryError::Storage`].
    /// When the retries run out the last error is wrapped in
    /// [`MemoryError::RetriesExhausted`]. The connection lock is released
    /// between attempts.
    ///
    /// Blocks the calling thread, backoff sleeps included. Async code should
    /// go through [`call`](Self::call).
    pub fn with_retry<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0;
        loop {
            let outcome = {
                let mut conn = self
                    .conn
                    .lock()
                    .map_err(|_| MemoryError::Internal("database lock poisoned".into()))?;
                op(&mut conn)
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if is_busy_or_locked(&err) => {
                    if attempt >= self.retry.max_retries {
                        return Err(MemoryError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Database busy, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(MemoryError::Storage(err)),
            }
        }
    }

    /// [`with_retry`](Self::with_retry) on tokio's blocking pool.
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_retry(op))
            .await
            .map_err(|e| MemoryError::Internal(format!("storage task failed: {e}")))?
    }
}

/// Whether a rusqlite error is a transient lock conflict.
pub(crate) fn is_busy_or_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Create all tables and indexes. Idempotent.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS transcript_turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transcript_turns_session
    ON transcript_turns(session_id, id);

CREATE TABLE IF NOT EXISTS summaries (
    user_id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS summarization_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    session_id TEXT,
    trigger_reason TEXT NOT NULL,
    chars_before INTEGER NOT NULL,
    chars_after INTEGER NOT NULL,
    model_used TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS compression_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id TEXT NOT NULL,
    trigger_reason TEXT NOT NULL,
    chars_before INTEGER NOT NULL,
    chars_after INTEGER NOT NULL,
    compression_ratio REAL NOT NULL,
    compression_count INTEGER NOT NULL,
    model_used TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_compression_events_subject
    ON compression_events(subject_id, created_at);
";

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )
    }

    fn quick_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn call_retries_busy_errors_off_the_runtime() {
        let db = Database::open_in_memory(quick_retry(2)).unwrap();
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = attempts.clone();
        let value = db
            .call(move |_| {
                if seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(busy())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory(RetryConfig::storage()).unwrap();
        assert_eq!(db.retry_config(), &RetryConfig::storage());
        db.with_retry(|conn| migrate(conn)).unwrap();
        let tables: i64 = db
            .with_retry(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('transcript_turns', 'summaries',
                                  'summarization_events', 'compression_events')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn busy_errors_are_retried_until_success() {
        let db = Database::open_in_memory(quick_retry(3)).unwrap();
        let calls = Cell::new(0);
        let value = db
            .with_retry(|_| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 { Err(busy()) } else { Ok(42) }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhausted_retries_surface_the_last_error() {
        let db = Database::open_in_memory(quick_retry(2)).unwrap();
        let calls = Cell::new(0);
        let err = db
            .with_retry(|_| -> rusqlite::Result<()> {
                calls.set(calls.get() + 1);
                Err(busy())
            })
            .unwrap_err();
        assert!(matches!(err, MemoryError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let db = Database::open_in_memory(quick_retry(5)).unwrap();
        let calls = Cell::new(0);
        let err = db
            .with_retry(|conn| {
                calls.set(calls.get() + 1);
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])
            })
            .unwrap_err();
        assert!(matches!(err, MemoryError::Storage(_)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("mnemo.db"), RetryConfig::storage()).unwrap();
        let mode: String = db
            .with_retry(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
