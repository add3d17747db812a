//! Speech-synthesis service interface and the OpenAI-compatible HTTP client.
//!
//! [`OpenAiSynthesizer`] calls `POST {base_url}/v1/audio/speech` with
//! `response_format = "pcm"` and returns the raw 16-bit little-endian bytes.
//! Anything else that speaks the same wire format (OpenAI, Kokoro-FastAPI,
//! openedai-speech, …) works unchanged.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::TtsConfig;

// ---------------------------------------------------------------------------
// SynthError
// ---------------------------------------------------------------------------

/// Errors returned by a speech-synthesis service.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SynthError {
    /// The service asked us to slow down (HTTP 429).
    #[error("speech service rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    /// Transport or connection failure.
    #[error("speech request failed: {0}")]
    Request(String),

    /// The request did not complete within the configured timeout.
    #[error("speech request timed out")]
    Timeout,

    /// The service answered with an unexpected status.
    #[error("speech service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Credentials, model or endpoint are wrong; retrying cannot help.
    #[error("speech service rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The service returned a success status with no audio.
    #[error("speech service returned no audio")]
    Empty,
}

impl SynthError {
    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => SynthError::RateLimited { retry_after },
            401 | 403 | 404 => SynthError::Rejected { status, body },
            _ => SynthError::Status { status, body },
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SynthError::RateLimited { .. })
    }

    /// Worth retrying the same request after a short pause.
    pub fn is_transient(&self) -> bool {
        match self {
            SynthError::Request(_) | SynthError::Timeout => true,
            SynthError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The whole session is misconfigured.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SynthError::Rejected { .. })
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SynthError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SynthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SynthError::Timeout
        } else {
            SynthError::Request(e.to_string())
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are ignored; the caller falls back to its own spacing.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// SpeechSynthesizer trait
// ---------------------------------------------------------------------------

/// Turns one sentence into encoded audio bytes for a given voice.
///
/// Implementors must be `Send + Sync` so they can be shared as
/// `Arc<dyn SpeechSynthesizer>` between concurrent fetches.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, SynthError>;
}

// ---------------------------------------------------------------------------
// OpenAiSynthesizer
// ---------------------------------------------------------------------------

pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    config: TtsConfig,
}

impl OpenAiSynthesizer {
    pub fn from_config(config: &TtsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/audio/speech", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, SynthError> {
        let body = serde_json::json!({
            "model":           self.config.model,
            "input":           text,
            "voice":           voice,
            "response_format": "pcm"
        });

        let mut req = self.client.post(self.endpoint()).json(&body);

        let key = self.config.api_key.as_deref().unwrap_or("");
        if !key.is_empty() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(SynthError::from_status(status.as_u16(), body, retry_after));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(SynthError::Empty);
        }

        log::debug!("synth: {} bytes for {} chars ({voice})", bytes.len(), text.len());
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
