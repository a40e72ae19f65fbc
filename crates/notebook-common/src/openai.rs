/// Client for OpenAI-compatible `/chat/completions` endpoints.
///
/// Two call shapes are offered: [`OpenAiClient::complete`] returns the whole reply text
/// and [`OpenAiClient::stream`] returns the reply as a stream of text fragments.
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Exponential backoff with up to 25% jitter on top of the capped delay.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let capped = self.initial.saturating_mul(factor).min(self.max);
        let spread = (capped.as_millis() as u64 / 4).max(1);
        capped + Duration::from_millis(jitter_below(spread + 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

fn jitter_below(bound: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    nanos % bound
}

#[derive(Clone, Debug)]
pub struct OpenAiClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Used when a call does not pass its own timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Upstream error bodies are cut to this many bytes before they reach an error.
    pub error_body_limit: usize,
}

impl Default for OpenAiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            error_body_limit: 8 * 1024,
        }
    }
}

impl OpenAiClientConfig {
    /// Reads `OPENAI_*` variables. Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url: String = env_or("OPENAI_BASE_URL", defaults.base_url);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            timeout: Duration::from_secs(env_or(
                "OPENAI_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
            retry: RetryPolicy {
                max_retries: env_or("OPENAI_MAX_RETRIES", defaults.retry.max_retries),
                initial: Duration::from_millis(env_or(
                    "OPENAI_RETRY_INITIAL_MS",
                    defaults.retry.initial.as_millis() as u64,
                )),
                max: Duration::from_millis(env_or(
                    "OPENAI_RETRY_MAX_MS",
                    defaults.retry.max.as_millis() as u64,
                )),
            },
            error_body_limit: env_or("OPENAI_MAX_ERROR_BODY_BYTES", defaults.error_body_limit),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenAiClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: StatusCode, message: String },

    #[error("completion had no content")]
    EmptyCompletion,

    #[error("streaming response ended without a completion")]
    StreamEnded,
}

impl OpenAiClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, OpenAiClientError::Request(e) if e.is_timeout())
    }

    /// Transient failures worth another attempt. A timed-out call has already used
    /// its budget, so it is left to the caller.
    fn is_transient(&self) -> bool {
        match self {
            OpenAiClientError::Request(e) => !e.is_timeout() && (e.is_connect() || e.is_request()),
            OpenAiClientError::Upstream { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

/// A lazily consumed stream of assistant text fragments.
pub type DeltaStream = BoxStream<'static, Result<String, OpenAiClientError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

/// Body of a chat completion call, built up with the setter methods.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            response_format: None,
            stream: false,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Ask the model for a single JSON object.
    pub fn json_mode(mut self) -> Self {
        self.response_format = Some(ResponseFormat {
            r#type: "json_object",
        });
        self
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorObject,
}

#[derive(Deserialize)]
struct ErrorObject {
    message: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiClientConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiClientConfig) -> Result<Self, OpenAiClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("pokeprof-notebook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OpenAiClientConfig {
        &self.config
    }

    /// One non-streaming completion. Returns the text of the first choice.
    pub async fn complete(
        &self,
        request: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<String, OpenAiClientError> {
        let body = ChatRequest {
            stream: false,
            ..request.clone()
        };
        let resp = self.send(&body, timeout).await?;
        let parsed: CompletionBody = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(OpenAiClientError::EmptyCompletion)
    }

    /// Streaming completion. Only connection setup is retried. Once the upstream has
    /// answered with a success status the body is never retried, since that would
    /// repeat fragments already handed out.
    ///
    /// `timeout` bounds the whole exchange, body included.
    pub async fn stream(
        &self,
        request: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<DeltaStream, OpenAiClientError> {
        let body = ChatRequest {
            stream: true,
            ..request.clone()
        };
        let resp = self.send(&body, timeout).await?;

        let state = (resp.bytes_stream().boxed(), SseDecoder::default());
        let deltas = stream::unfold(Some(state), |state| async move {
            let Some((mut bytes, mut decoder)) = state else {
                return None;
            };
            loop {
                match decoder.next_event() {
                    Some(SseEvent::Done) => return None,
                    Some(SseEvent::Delta(text)) => return Some((Ok(text), Some((bytes, decoder)))),
                    None => {}
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), None)),
                    None => return Some((Err(OpenAiClientError::StreamEnded), None)),
                }
            }
        });
        Ok(deltas.boxed())
    }

    /// POST `body` and hand back a success response, retrying transient failures.
    async fn send(
        &self,
        body: &ChatRequest,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, OpenAiClientError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let timeout = timeout.unwrap_or(self.config.timeout);
        let policy = &self.config.retry;

        let mut retry = 0;
        loop {
            let err = match self.send_once(&url, body, timeout).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            if retry >= policy.max_retries || !err.is_transient() {
                return Err(err);
            }
            let delay = policy.delay(retry);
            retry += 1;
            warn!(
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chat completion failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(
        &self,
        url: &str,
        body: &ChatRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, OpenAiClientError> {
        let mut builder = self.http.post(url).timeout(timeout).json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = match resp.bytes().await {
            Ok(raw) => upstream_message(&raw, self.config.error_body_limit),
            Err(e) => format!("<unreadable error body: {e}>"),
        };
        Err(OpenAiClientError::Upstream { status, message })
    }
}

/// The `error.message` of an OpenAI error envelope, or else the body itself cut to
/// `limit` bytes.
fn upstream_message(raw: &[u8], limit: usize) -> String {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(raw) {
        if let Some(message) = envelope.error.message {
            return message;
        }
    }
    String::from_utf8_lossy(&raw[..raw.len().min(limit)]).into_owned()
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for the `text/event-stream` body of a streaming completion.
///
/// Bytes are buffered until a blank line ends an event. A `data:` line holds either
/// the `[DONE]` sentinel or a JSON chunk whose first choice may carry text. Chunks
/// without text (role announcements, keep-alives) are skipped.
#[derive(Default)]
struct SseDecoder {
    buffer: String,
    ready: VecDeque<SseEvent>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            let payloads = block
                .lines()
                .filter_map(|line| line.trim().strip_prefix("data:"))
                .map(str::trim)
                .filter(|data| !data.is_empty());
            for data in payloads {
                if data == "[DONE]" {
                    self.ready.push_back(SseEvent::Done);
                    continue;
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => {
                        let text = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|choice| choice.delta.content)
                            .filter(|text| !text.is_empty());
                        if let Some(text) = text {
                            self.ready.push_back(SseEvent::Delta(text));
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping malformed stream chunk"),
                }
            }
        }
    }

    fn next_event(&mut self) -> Option<SseEvent> {
        self.ready.pop_front()
    }
}
