//! Text-generation backend interface and the OpenAI-compatible streaming
//! client.
//!
//! [`OpenAiGenerator`] calls `POST {base_url}/v1/chat/completions` with
//! `stream = true` and turns the SSE deltas into [`TextEvent`]s.  Works with
//! Ollama (OpenAI mode), OpenAI, Groq, LM Studio, vLLM and friends.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::llm::sse::SseDecoder;

// ---------------------------------------------------------------------------
// GenerationError
// ---------------------------------------------------------------------------

/// Errors from the text-generation backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    /// HTTP transport or connection error.
    #[error("generation request failed: {0}")]
    Request(String),

    /// The request did not complete within the configured timeout.
    #[error("generation request timed out")]
    Timeout,

    /// Non-success status that may clear up on its own (429, 5xx).
    #[error("generation backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Credentials, model or endpoint are wrong.
    #[error("generation backend rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// A stream chunk could not be parsed.
    #[error("failed to parse generation stream: {0}")]
    Parse(String),

    /// The backend reported an error inside the stream.
    #[error("generation backend error: {0}")]
    Remote(String),

    /// The stream closed before its end marker.
    #[error("generation stream ended unexpectedly")]
    Interrupted,
}

impl GenerationError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 | 404 => GenerationError::Rejected { status, body },
            _ => GenerationError::Status { status, body },
        }
    }

    /// A dropped connection or overloaded backend; worth one more try.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Request(_)
            | GenerationError::Timeout
            | GenerationError::Remote(_)
            | GenerationError::Interrupted => true,
            GenerationError::Status { status, .. } => *status == 429 || *status >= 500,
            GenerationError::Rejected { .. } | GenerationError::Parse(_) => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GenerationError::Rejected { .. })
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GenerationError::Timeout
        } else {
            GenerationError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request / event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

const CONTINUE_INSTRUCTION: &str = "Your last reply was cut off. Continue exactly where it \
stopped, without repeating anything already said and without a name prefix.";

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// Request that continues after `already_said` instead of starting over.
    pub fn resumed(&self, already_said: &str) -> Self {
        let mut messages = self.messages.clone();
        messages.push(ChatMessage::assistant(already_said.trim()));
        messages.push(ChatMessage::user(CONTINUE_INSTRUCTION));
        Self { messages }
    }
}

/// One item of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEvent {
    /// A content fragment; may split words.
    Token(String),
    /// Echo of the speaker role; not content.
    Role(String),
    /// Explicit end of the reply.
    End,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TextEvent, GenerationError>> + Send>>;

// ---------------------------------------------------------------------------
// TextGenerator trait
// ---------------------------------------------------------------------------

/// Opaque token-stream producer.
///
/// Dropping the returned stream cancels the in-flight request.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<TokenStream, GenerationError>;
}

// ---------------------------------------------------------------------------
// OpenAiGenerator
// ---------------------------------------------------------------------------

pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiGenerator {
    /// The timeout bounds connection setup only; a reply may stream for
    /// longer than `timeout_secs`.
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<TokenStream, GenerationError> {
        let body = serde_json::json!({
            "model":       self.config.model,
            "messages":    request.messages,
            "stream":      true,
            "temperature": self.config.temperature,
            "max_tokens":  self.config.max_tokens
        });

        let mut req = self.client.post(self.endpoint()).json(&body);

        let key = self.config.api_key.as_deref().unwrap_or("");
        if !key.is_empty() {
            req = req.bearer_auth(key);
        }

        let first_byte = Duration::from_secs(self.config.timeout_secs);
        let response = tokio::time::timeout(first_byte, req.send())
            .await
            .map_err(|_| GenerationError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status.as_u16(), body));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(GenerationError::from(e));
                        return;
                    }
                };
                for data in decoder.push(&chunk) {
                    match parse_chunk(&data) {
                        Ok(events) => {
                            for event in events {
                                let end = event == TextEvent::End;
                                yield Ok(event);
                                if end {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(data) = decoder.finish() {
                if let Ok(events) = parse_chunk(&data) {
                    for event in events {
                        yield Ok(event);
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Translate one SSE payload into stream events.
pub fn parse_chunk(data: &str) -> Result<Vec<TextEvent>, GenerationError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(vec![TextEvent::End]);
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|e| GenerationError::Parse(e.to_string()))?;

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string());
        return Err(GenerationError::Remote(message));
    }

    let mut events = Vec::new();
    let Some(choice) = json["choices"].get(0) else {
        return Ok(events);
    };

    if let Some(role) = choice["delta"]["role"].as_str() {
        events.push(TextEvent::Role(role.to_owned()));
    }
    if let Some(content) = choice["delta"]["content"].as_str() {
        if !content.is_empty() {
            events.push(TextEvent::Token(content.to_owned()));
        }
    }
    if choice["finish_reason"].is_string() {
        events.push(TextEvent::End);
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
