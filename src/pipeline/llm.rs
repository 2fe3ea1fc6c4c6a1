//! Completion backends: the only stage with network I/O.
//!
//! The engines talk to a [`CompletionService`]: an ordered list of
//! [`Message`]s in, generated text out, or one of the four
//! [`ServiceError`] kinds. Two backends implement it:
//!
//! * [`ChatCompletionsService`]: a plain OpenAI-compatible
//!   `/chat/completions` client (Groq, OpenAI, vLLM, LiteLLM, …). The API key
//!   and endpoint are handed in at construction; nothing is read from the
//!   process environment.
//! * [`ProviderService`]: an adapter over any `edgequake_llm::LLMProvider`,
//!   for Anthropic, Gemini, Ollama and the other providers that crate knows.
//!
//! ## Retry Strategy
//!
//! Rate limits (429) and timeouts are routine under concurrent load, while a
//! malformed response or a dead endpoint will not fix itself on a second try.
//! [`RetryingService`] wraps any backend with a [`RetryPolicy`];
//! [`ExponentialBackoff`] retries only the transient kinds, waiting
//! `base_ms * 2^(attempt-1)` (500 ms → 1 s → 2 s with the defaults) or the
//! server's `Retry-After` when one was sent.
//!
//! Completions are not deterministic: a retry yields *a* plausible answer,
//! not the same one.

use crate::error::{ServiceError, TranscribeError};
use crate::pipeline::messages::{Message, MessageContent, Role};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Default model for [`ChatCompletionsService`].
pub const DEFAULT_MODEL: &str = "meta-llama/llama-4-maverick-17b-128e-instruct";

/// One model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Model parameters shared by every request an engine sends.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            temperature: 0.1,
        }
    }
}

impl ModelSettings {
    pub fn request(&self, messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Generated text plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Stateless request/response access to a generative model.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Run one completion. Identical requests may return different text.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError>;

    /// Short label used in logs.
    fn name(&self) -> &str {
        "completion"
    }
}

// ── OpenAI-compatible HTTP backend ───────────────────────────────────────

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl std::fmt::Debug for ChatCompletionsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsService")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ChatCompletionsService {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TranscribeError::ProviderNotConfigured {
                provider: "chat-completions".to_string(),
                hint: format!("HTTP client could not be built: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ServiceError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl CompletionService for ChatCompletionsService {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        let body = WireRequest::from_request(request);
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &text));
        }

        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        parse_response(&text)
    }

    fn name(&self) -> &str {
        "chat-completions"
    }
}

/// Map a non-success HTTP status to a service error kind.
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> ServiceError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ServiceError::Timeout { secs: 0 }
        }
        s if s.is_server_error() => ServiceError::Unavailable(format!("HTTP {s}: {snippet}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::Unavailable(format!("HTTP {status}: credentials rejected"))
        }
        s => ServiceError::InvalidResponse(format!("HTTP {s}: {snippet}")),
    }
}

/// Decode a `/chat/completions` response body.
pub(crate) fn parse_response(body: &str) -> Result<Completion, ServiceError> {
    let parsed: WireResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("undecodable body: {e}")))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ServiceError::InvalidResponse("response has no choices".into()))?;
    let usage = parsed.usage.unwrap_or_default();
    Ok(Completion {
        text,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: usize,
    temperature: f32,
}

impl<'a> WireRequest<'a> {
    pub(crate) fn from_request(request: &'a CompletionRequest) -> Self {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role,
                content: match &m.content {
                    MessageContent::Text(t) => WireContent::Text(t.clone()),
                    MessageContent::Image(img) => WireContent::Parts(vec![WirePart::ImageUrl {
                        image_url: WireImageUrl {
                            url: img.to_data_url(),
                        },
                    }]),
                },
            })
            .collect();
        Self {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

// ── edgequake-llm provider adapter ───────────────────────────────────────

/// Adapter exposing an `edgequake_llm` provider as a [`CompletionService`].
///
/// The provider is already bound to a model, so `CompletionRequest::model`
/// is only used for logging here.
pub struct ProviderService {
    provider: Arc<dyn LLMProvider>,
    timeout: Duration,
}

impl ProviderService {
    pub fn new(provider: Arc<dyn LLMProvider>, timeout_secs: u64) -> Self {
        Self {
            provider,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl CompletionService for ProviderService {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        let messages = to_chat_messages(&request.messages);
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| ServiceError::Timeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            request.model, response.prompt_tokens, response.completion_tokens
        );
        Ok(Completion {
            text: response.content,
            prompt_tokens: response.prompt_tokens as usize,
            completion_tokens: response.completion_tokens as usize,
        })
    }

    fn name(&self) -> &str {
        "provider"
    }
}

fn to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| match (&m.role, &m.content) {
            (Role::System, MessageContent::Text(t)) => ChatMessage::system(t.as_str()),
            (Role::User, MessageContent::Text(t)) => ChatMessage::user(t.as_str()),
            (_, MessageContent::Image(img)) => {
                ChatMessage::user_with_images("", vec![img.to_image_data()])
            }
        })
        .collect()
}

/// Sort a provider error message into a service error kind.
///
/// `edgequake-llm` errors cross this boundary as display strings, so the kind
/// is recovered from the usual status codes and phrases.
pub(crate) fn classify_provider_error(msg: &str) -> ServiceError {
    let lower = msg.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        ServiceError::RateLimited {
            retry_after_secs: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ServiceError::Timeout { secs: 0 }
    } else if lower.contains("parse") || lower.contains("deserializ") || lower.contains("invalid response") {
        ServiceError::InvalidResponse(msg.to_string())
    } else {
        ServiceError::Unavailable(msg.to_string())
    }
}

// ── Retry ────────────────────────────────────────────────────────────────

/// Decides whether, and after how long, a failed call is retried.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` is the 1-based number of the retry about to be made.
    /// Return `None` to give up and surface `error`.
    fn backoff(&self, attempt: u32, error: &ServiceError) -> Option<Duration>;
}

/// Never retry.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn backoff(&self, _attempt: u32, _error: &ServiceError) -> Option<Duration> {
        None
    }
}

/// Bounded exponential backoff for `RateLimited` and `Timeout` only.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn backoff(&self, attempt: u32, error: &ServiceError) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries || !error.is_transient() {
            return None;
        }
        let ms = match error {
            ServiceError::RateLimited {
                retry_after_secs: Some(secs),
            } => secs.saturating_mul(1000),
            _ => self
                .base_ms
                .saturating_mul(1u64 << (attempt - 1).min(20)),
        };
        Some(Duration::from_millis(ms.min(self.max_delay_ms)))
    }
}

/// Wraps a backend with a [`RetryPolicy`].
pub struct RetryingService {
    inner: Arc<dyn CompletionService>,
    policy: Arc<dyn RetryPolicy>,
}

impl RetryingService {
    pub fn new(inner: Arc<dyn CompletionService>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl CompletionService for RetryingService {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(err) => {
                    attempt += 1;
                    match self.policy.backoff(attempt, &err) {
                        Some(delay) => {
                            warn!(
                                "{}: {}, retry {} after {}ms",
                                self.inner.name(),
                                err,
                                attempt,
                                delay.as_millis()
                            );
                            sleep(delay).await;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
