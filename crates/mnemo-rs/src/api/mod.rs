//! API interaction layer: the text-generator seam and retry.
//!
//! - [`generator`]: the [`TextGenerator`] trait, [`GenerationRequest`], the
//!   OpenRouter implementation, and [`generate_with_timeout`].
//! - [`retry`]: exponential backoff with jitter, shared by the generator
//!   (transient HTTP errors) and the SQLite layer (busy/locked errors).

pub mod generator;
pub mod retry;

// Re-export commonly used items at the module level.
pub use generator::{
    GenerateFuture, GenerationRequest, OpenRouterGenerator, TextGenerator, generate_with_timeout,
};
pub use retry::RetryConfig;
