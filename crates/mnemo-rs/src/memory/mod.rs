//! Memory lifecycle: summarization, compaction, and the engine facade.
//!
//! - [`engine`]: [`MemoryEngine`], which records turns, triggers
//!   summarization, and builds prompts.
//! - [`summarizer`]: drains a session transcript into the user's summary.
//! - [`compactor`]: shrinks an over-large summary with a guarded replace.
//! - [`marker`]: the compaction count embedded in a compacted summary.

pub mod compactor;
pub mod engine;
pub mod marker;
pub mod summarizer;

// Re-export commonly used items at the module level.
pub use compactor::Compactor;
pub use engine::{MemoryEngine, MemoryStats, TurnRecorded};
pub use marker::CompressionMarker;
pub use summarizer::{
    SummarizeOutcome, Summarizer, TRIGGER_AUTO_DISCONNECT, TRIGGER_AUTO_LIMIT, TRIGGER_MANUAL,
    format_transcript,
};
