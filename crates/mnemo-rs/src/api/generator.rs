//! The text-generation seam.
//!
//! Summarization and compaction both call out to a [`TextGenerator`]. The
//! engine only depends on the trait; [`OpenRouterGenerator`] is the bundled
//! implementation and tests substitute scripted ones.
//!
//! Every engine call goes through [`generate_with_timeout`], which bounds
//! the call and normalizes empty output into [`GenerationError::Empty`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api::retry::{RetryConfig, retry_api_call};
use crate::context::DEFAULT_CHARS_PER_TOKEN;
use crate::error::{GenerationError, MemoryError, Result};
use crate::{ChatRequest, Message, OpenRouterClient};

/// Boxed future returned by [`TextGenerator::generate`].
pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<String, GenerationError>> + Send + 'a>>;

/// One generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub user_prompt: String,
    pub temperature: f32,
    /// Soft cap on the output length.
    pub max_output_chars: usize,
    /// Model override; `None` uses the generator's own model.
    pub model: Option<String>,
}

/// Produces text from a prompt. May fail or be slow.
///
/// # Example
///
/// ```ignore
/// struct Canned(String);
///
/// impl TextGenerator for Canned {
///     fn generate<'a>(&'a self, _request: &'a GenerationRequest) -> GenerateFuture<'a> {
///         Box::pin(async move { Ok(self.0.clone()) })
///     }
///
///     fn model(&self) -> &str {
///         "canned"
///     }
/// }
/// ```
pub trait TextGenerator: Send + Sync {
    /// Generate text for `request`.
    ///
    /// Uses a boxed future so that the trait is dyn-compatible.
    fn generate<'a>(&'a self, request: &'a GenerationRequest) -> GenerateFuture<'a>;

    /// Model used when a request carries no override. Recorded in audit events.
    fn model(&self) -> &str;
}

/// Run `generator` with a timeout. Output is trimmed; blank output is an error.
pub async fn generate_with_timeout(
    generator: &dyn TextGenerator,
    request: &GenerationRequest,
    timeout: Duration,
) -> std::result::Result<String, GenerationError> {
    let text = match tokio::time::timeout(timeout, generator.generate(request)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "Text generation timed out");
            return Err(GenerationError::TimedOut(timeout));
        }
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(trimmed.to_string())
}

/// Convert a character cap into a token cap using the chars-per-token estimate.
pub fn max_tokens_for_chars(chars: usize) -> u32 {
    let tokens = (chars as f64 / DEFAULT_CHARS_PER_TOKEN).ceil();
    tokens.clamp(1.0, f64::from(u32::MAX)) as u32
}

// ── OpenRouter ─────────────────────────────────────────────────────

/// [`TextGenerator`] over the OpenRouter chat completions API.
///
/// Transient HTTP failures (429, 5xx, network errors) are retried with
/// [`RetryConfig::generation`] before the call is reported as failed.
#[derive(Debug)]
pub struct OpenRouterGenerator {
    client: OpenRouterClient,
    model: String,
    retry: RetryConfig,
}

impl OpenRouterGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = OpenRouterClient::new(api_key).map_err(MemoryError::Config)?;
        Ok(Self::with_client(client, model))
    }

    pub fn with_client(client: OpenRouterClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            retry: RetryConfig::generation(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn chat_request(&self, request: &GenerationRequest) -> ChatRequest {
        ChatRequest {
            model: Some(request.model.clone().unwrap_or_else(|| self.model.clone())),
            messages: vec![
                Message::system(request.system_instruction.as_str()),
                Message::user(request.user_prompt.as_str()),
            ],
            max_tokens: max_tokens_for_chars(request.max_output_chars),
            temperature: request.temperature,
        }
    }
}

impl TextGenerator for OpenRouterGenerator {
    fn generate<'a>(&'a self, request: &'a GenerationRequest) -> GenerateFuture<'a> {
        Box::pin(async move {
            let body = self.chat_request(request);
            let completion = retry_api_call(&self.retry, || self.client.chat(&body))
                .await
                .map_err(GenerationError::Failed)?;
            debug!(
                finish_reason = completion.finish_reason.as_deref().unwrap_or("-"),
                "Generation complete"
            );
            completion.content.ok_or(GenerationError::Empty)
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(std::result::Result<String, GenerationError>);

    impl TextGenerator for Fixed {
        fn generate<'a>(&'a self, _request: &'a GenerationRequest) -> GenerateFuture<'a> {
            let out = self.0.clone();
            Box::pin(async move { out })
        }

        fn model(&self) -> &str {
            "fixed"
        }
    }

    struct Slow;

    impl TextGenerator for Slow {
        fn generate<'a>(&'a self, _request: &'a GenerationRequest) -> GenerateFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late".to_string())
            })
        }

        fn model(&self) -> &str {
            "slow"
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_instruction: "sys".into(),
            user_prompt: "prompt".into(),
            temperature: 0.3,
            max_output_chars: 350,
            model: None,
        }
    }

    #[tokio::test]
    async fn output_is_trimmed() {
        let generator = Fixed(Ok("  summary text \n".into()));
        let out = generate_with_timeout(&generator, &request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, "summary text");
    }

    #[tokio::test]
    async fn blank_output_is_empty_error() {
        let generator = Fixed(Ok(" \n\t".into()));
        let err = generate_with_timeout(&generator, &request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Empty);
    }

    #[tokio::test]
    async fn failures_pass_through() {
        let generator = Fixed(Err(GenerationError::Failed("HTTP 500".into())));
        let err = generate_with_timeout(&generator, &request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Failed("HTTP 500".into()));
    }

    #[tokio::test]
    async fn slow_generator_times_out() {
        let timeout = Duration::from_millis(50);
        let err = generate_with_timeout(&Slow, &request(), timeout)
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::TimedOut(timeout));
    }

    #[test]
    fn char_cap_maps_to_tokens() {
        assert_eq!(max_tokens_for_chars(350), 100);
        assert_eq!(max_tokens_for_chars(0), 1);
    }

    #[test]
    fn chat_request_uses_override_model() {
        let generator = OpenRouterGenerator::new("key", "default/model").unwrap();
        let mut req = request();
        assert_eq!(
            generator.chat_request(&req).model.as_deref(),
            Some("default/model")
        );
        req.model = Some("other/model".into());
        let body = generator.chat_request(&req);
        assert_eq!(body.model.as_deref(), Some("other/model"));
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.max_tokens, 100);
    }
}
