//! Convenience re-exports for common `mnemo-rs` types.
//!
//! Meant to be glob-imported by services embedding the engine:
//!
//! ```ignore
//! use mnemo_rs::prelude::*;
//! ```
//!
//! This pulls in the engine, its configuration, the database and audit log,
//! the generator seam, and the prompt types. Repositories and the
//! summarizer/compactor internals are left out; import those from their
//! modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::DEFAULT_MODEL;

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::MemoryConfig;
pub use crate::error::{GenerationError, MemoryError};
pub use crate::memory::{
    CompressionMarker, MemoryEngine, MemoryStats, SummarizeOutcome, TRIGGER_AUTO_DISCONNECT,
    TRIGGER_AUTO_LIMIT, TRIGGER_MANUAL, TurnRecorded,
};

// ── Storage ─────────────────────────────────────────────────────────
pub use crate::store::{AuditEvent, AuditLog, CompressionStats, Database, Turn, TurnRole};

// ── Generation ──────────────────────────────────────────────────────
pub use crate::api::{
    GenerateFuture, GenerationRequest, OpenRouterGenerator, RetryConfig, TextGenerator,
    generate_with_timeout,
};

// ── Prompt context ──────────────────────────────────────────────────
pub use crate::context::{
    AssembledPrompt, BudgetAssembler, MemoryPressure, PromptBudget, PromptMetrics,
};
