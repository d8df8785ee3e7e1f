//! Error types for the memory engine.
//!
//! Two families:
//!
//! - [`MemoryError`] covers storage and configuration. These propagate to
//!   callers.
//! - [`GenerationError`] covers the external text generator. These never
//!   escape summarization or compaction; they turn into a `false` outcome and
//!   leave stored state untouched.

use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Storage, configuration, and internal failures.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A SQLite call failed with a non-transient error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A transient SQLite failure (busy/locked) outlived the retry budget.
    #[error("storage still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// Configuration rejected by [`MemoryConfig::validate`](crate::config::MemoryConfig::validate).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Poisoned locks, closed channels, and other "should not happen" states.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures of a [`TextGenerator`](crate::api::generator::TextGenerator) call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    /// The generator reported an error (HTTP failure, API error, ...).
    #[error("generation failed: {0}")]
    Failed(String),

    /// The call did not finish within the configured timeout.
    #[error("generation timed out after {0:?}")]
    TimedOut(Duration),

    /// The generator returned no usable text.
    #[error("generation returned empty output")]
    Empty,
}
