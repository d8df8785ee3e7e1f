//! Session transcript repository: CRUD for the `transcript_turns` table.
//!
//! Turns are immutable once written and are only ever deleted en masse, when
//! a session is summarized or cleared.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

/// Fixed per-turn overhead added to the transcript size, accounting for the
/// `": "` separator and line break in the formatted transcript.
pub const TURN_OVERHEAD_CHARS: usize = 4;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    /// Stored form: `"user"` / `"assistant"`.
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    /// Capitalized form used in formatted transcripts.
    pub fn label(self) -> &'static str {
        match self {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            other => Err(format!("unknown turn role: {other}")),
        }
    }
}

/// One role-tagged message in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    /// Row id; increases with append order.
    pub id: i64,
    pub user_id: String,
    pub session_id: String,
    pub role: TurnRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Contribution of this turn to the transcript size.
    pub fn size_chars(&self) -> usize {
        self.role.as_str().chars().count() + self.text.chars().count() + TURN_OVERHEAD_CHARS
    }

    /// `Role: text`, as it appears in a formatted transcript.
    pub fn as_line(&self) -> String {
        format!("{}: {}", self.role.label(), self.text)
    }
}

/// Transcript repository. Stateless; every method takes `&Connection`.
pub struct TranscriptStore;

impl TranscriptStore {
    /// Append a turn to the session.
    pub fn append(
        conn: &Connection,
        user_id: &str,
        session_id: &str,
        role: TurnRole,
        text: &str,
    ) -> rusqlite::Result<Turn> {
        let now = Utc::now();
        conn.execute(
            "INSERT INTO transcript_turns (user_id, session_id, role, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, session_id, role.as_str(), text, now],
        )?;
        Ok(Turn {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            role,
            text: text.to_string(),
            created_at: now,
        })
    }

    /// Sum of `len(role) + len(text) + 4` over the session's turns, in chars.
    pub fn size(conn: &Connection, session_id: &str) -> rusqlite::Result<usize> {
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(role) + LENGTH(text) + ?2), 0)
             FROM transcript_turns WHERE session_id = ?1",
            params![session_id, TURN_OVERHEAD_CHARS as i64],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(total).unwrap_or(0))
    }

    /// All turns of the session, oldest first.
    pub fn all_turns(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<Turn>> {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, session_id, role, text, created_at
             FROM transcript_turns WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let role: String = row.get(3)?;
            let role = role.parse::<TurnRole>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?;
            Ok(Turn {
                id: row.get(0)?,
                user_id: row.get(1)?,
                session_id: row.get(2)?,
                role,
                text: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    /// Delete the session's turns up to and including `last_id`. Turns
    /// appended after a snapshot was taken survive.
    pub fn clear_through(
        conn: &Connection,
        session_id: &str,
        last_id: i64,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "DELETE FROM transcript_turns WHERE session_id = ?1 AND id <= ?2",
            params![session_id, last_id],
        )
    }

    /// Delete every turn of the session. Returns the number removed.
    pub fn clear(conn: &Connection, session_id: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "DELETE FROM transcript_turns WHERE session_id = ?1",
            params![session_id],
        )
    }
}
