//! Bounded conversational memory and prompt-budget engine.
//!
//! `mnemo-rs` keeps the conversational context of an assistant backend
//! within fixed character limits. It has three parts:
//!
//! - a per-session **transcript** that is summarized automatically when it
//!   nears its limit,
//! - a per-user **summary** that is compacted, with a backup and a
//!   compare-and-swap replace, when it nears its own limit,
//! - a **prompt assembler** that merges base instructions, the summary, the
//!   most recent transcript lines, and retrieved context into one string that
//!   stays under a hard character budget.
//!
//! Text generation is an external collaborator behind the
//! [`TextGenerator`](api::generator::TextGenerator) trait. The bundled
//! [`OpenRouterGenerator`](api::generator::OpenRouterGenerator) talks to the
//! [OpenRouter](https://openrouter.ai/) chat completions API; tests plug in
//! scripted generators.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use mnemo_rs::error::Result;
//! use mnemo_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(MemoryConfig::default());
//!     let db = Database::open("memory.db", config.storage_retry.clone())?;
//!     let (audit, writer) = AuditLog::spawn_writer(db.clone());
//!
//!     let api_key = std::env::var("OPENROUTER_KEY").unwrap_or_default();
//!     let generator = Arc::new(OpenRouterGenerator::new(api_key, DEFAULT_MODEL)?);
//!     let engine = MemoryEngine::new(db, generator, config, audit);
//!
//!     engine.record_turn("alice", "s1", TurnRole::User, "I moved to Lisbon.").await?;
//!     engine.record_turn("alice", "s1", TurnRole::Assistant, "Welcome!").await?;
//!
//!     let assembled = engine.build_prompt("alice", "s1", "You are helpful.", "")?;
//!     println!("{}", assembled.metrics.to_log_string());
//!
//!     drop(engine);
//!     let _ = writer.await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`memory`] | [`MemoryEngine`](memory::MemoryEngine), session summarization, summary compaction |
//! | [`context`] | [`BudgetAssembler`](context::BudgetAssembler), prompt metrics, memory pressure |
//! | [`store`] | SQLite database, transcript/summary repositories, audit log |
//! | [`api`] | Text generator seam, OpenRouter generator, retry with backoff |
//! | [`config`] | [`MemoryConfig`](config::MemoryConfig) |
//! | [`error`] | [`MemoryError`](error::MemoryError), [`GenerationError`](error::GenerationError) |
//!
//! # Guarantees
//!
//! 1. **A failed generation never destroys data.** The transcript is only
//!    cleared after its summary has been stored; a compaction only replaces
//!    the summary it was computed from.
//! 2. **Assembly never fails.** An over-budget prompt comes back flagged
//!    (`within_limits == false`), not as an error.
//! 3. **No global state.** Every component receives its configuration and
//!    database handle at construction.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod prelude;
pub mod store;

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for summarization and compaction.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unused optional fields are omitted from
/// serialization.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in a chat request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
        }
    }
}

/// A message in a chat request.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from [`OpenRouterClient::chat`].
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl RawChatResponse {
    fn into_completion(self) -> Result<ChatCompletion, String> {
        if let Some(err) = self.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }
        let choice = self.choices.and_then(|c| c.into_iter().next());
        Ok(match choice {
            Some(c) => ChatCompletion {
                content: c.message.content,
                usage: self.usage,
                finish_reason: c.finish_reason,
            },
            None => ChatCompletion {
                content: None,
                usage: self.usage,
                finish_reason: None,
            },
        })
    }
}

// ── Client ─────────────────────────────────────────────────────────

const CLIENT_REFERER: &str = "https://github.com/mnemo-rs";
const CLIENT_TITLE: &str = "mnemo-rs";

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient").finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("mnemo-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}, temp={}",
            body.model.as_deref().unwrap_or("(none)"),
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", CLIENT_REFERER)
            .header("X-Title", CLIENT_TITLE)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        parsed.into_completion()
    }
}
