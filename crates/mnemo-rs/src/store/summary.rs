//! Persistent summary repository: CRUD for the `summaries` table.
//!
//! One row per user. Rows are mutated by [`append`](SummaryStore::append)
//! (newline-joined concatenation) and by
//! [`replace_if_unchanged`](SummaryStore::replace_if_unchanged), the
//! compare-and-swap used by compaction. Only an explicit clear deletes a row.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

/// A user's long-lived summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub user_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a compare-and-swap replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The stored value matched and was replaced.
    Replaced,
    /// The stored value no longer matched (or the row is gone); nothing written.
    Conflict,
    /// The write did not read back as expected; rolled back.
    VerifyFailed,
}

/// Summary repository. Stateless; every method takes a connection.
pub struct SummaryStore;

impl SummaryStore {
    /// Current summary text, if any.
    pub fn get(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<String>> {
        conn.query_row(
            "SELECT text FROM summaries WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
    }

    /// Full summary row, if any.
    pub fn get_record(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<Summary>> {
        conn.query_row(
            "SELECT user_id, text, created_at, updated_at FROM summaries WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(Summary {
                    user_id: row.get(0)?,
                    text: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
    }

    /// Summary length in chars (0 when absent).
    pub fn size(conn: &Connection, user_id: &str) -> rusqlite::Result<usize> {
        let len: Option<i64> = conn
            .query_row(
                "SELECT LENGTH(text) FROM summaries WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(len.and_then(|l| usize::try_from(l).ok()).unwrap_or(0))
    }

    /// Append `text` on a new line, creating the row if absent.
    pub fn append(conn: &Connection, user_id: &str, text: &str) -> rusqlite::Result<()> {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO summaries (user_id, text, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 text = summaries.text || char(10) || excluded.text,
                 updated_at = excluded.updated_at",
            params![user_id, text, now],
        )?;
        Ok(())
    }

    /// Unconditionally set the summary text, creating the row if absent.
    pub fn put(conn: &Connection, user_id: &str, text: &str) -> rusqlite::Result<()> {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO summaries (user_id, text, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 text = excluded.text,
                 updated_at = excluded.updated_at",
            params![user_id, text, now],
        )?;
        Ok(())
    }

    /// Delete the user's summary. Returns whether a row existed.
    pub fn clear(conn: &Connection, user_id: &str) -> rusqlite::Result<bool> {
        let n = conn.execute("DELETE FROM summaries WHERE user_id = ?1", params![user_id])?;
        Ok(n > 0)
    }

    /// Replace the summary with `new_text` only if it still equals `expected`.
    ///
    /// Runs in a `BEGIN IMMEDIATE` transaction, so no other connection can
    /// write between the comparison and the update. The written value is read
    /// back inside the transaction; a mismatch rolls everything back.
    pub fn replace_if_unchanged(
        conn: &mut Connection,
        user_id: &str,
        expected: &str,
        new_text: &str,
    ) -> rusqlite::Result<ReplaceOutcome> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::get(&tx, user_id)?;
        if current.as_deref() != Some(expected) {
            tx.rollback()?;
            return Ok(ReplaceOutcome::Conflict);
        }

        let updated = tx.execute(
            "UPDATE summaries SET text = ?2, updated_at = ?3 WHERE user_id = ?1",
            params![user_id, new_text, Utc::now()],
        )?;

        let written = Self::get(&tx, user_id)?;
        if updated != 1 || written.as_deref() != Some(new_text) {
            tx.rollback()?;
            return Ok(ReplaceOutcome::VerifyFailed);
        }

        tx.commit()?;
        Ok(ReplaceOutcome::Replaced)
    }
}
