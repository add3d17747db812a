//! Turn-level types: hosts, the active speaking turn, its outcome, and the
//! turn failure taxonomy.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::segmenter::Sentence;
use crate::llm::GenerationError;
use crate::speech::DispatchError;

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// A simulated speaker taking part in the rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: String,
    pub name: String,
    /// Voice identity passed to the synthesizer.
    pub voice: String,
    pub persona: String,
}

impl Host {
    pub fn new(id: &str, name: &str, voice: &str, persona: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            voice: voice.to_owned(),
            persona: persona.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// SpeakingTurn
// ---------------------------------------------------------------------------

/// One host's continuous attempt to speak.
///
/// The turn owns its cancellation token; whoever holds a clone of it can stop
/// the turn, and nothing else can.
#[derive(Debug, Clone)]
pub struct SpeakingTurn {
    pub id: u64,
    pub host: Host,
    cancel: CancellationToken,
}

impl SpeakingTurn {
    pub fn new(id: u64, host: Host, cancel: CancellationToken) -> Self {
        Self { id, host, cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// ChainError
// ---------------------------------------------------------------------------

/// Why a turn could not make forward progress.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    #[error("text generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("speech synthesis unavailable: {0}")]
    Synthesis(DispatchError),

    #[error("speech dispatcher stopped unexpectedly")]
    DispatcherClosed,
}

impl ChainError {
    /// Retrying the turn cannot help; the session should halt.
    pub fn is_fatal(&self) -> bool {
        match self {
            ChainError::Generation(e) => e.is_fatal(),
            ChainError::Synthesis(e) => e.is_fatal(),
            ChainError::DispatcherClosed => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TurnOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEnd {
    /// The text stream ended and every queued sentence was played or skipped.
    Completed,
    /// The turn's token fired.
    Cancelled,
    /// The turn gave up after exhausting its retries.
    Failed(ChainError),
}

/// What a finished turn actually put in the listener's ears.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: u64,
    pub host: Host,
    /// Sentences whose audio started playing.
    pub spoken: Vec<Sentence>,
    /// Sentences (and trailing partial text) that never started playing.
    pub unspoken: Vec<Sentence>,
    /// Sentences that could not be synthesised or played.
    pub skipped: Vec<Sentence>,
    pub end: TurnEnd,
}

impl TurnOutcome {
    pub fn completed(&self) -> bool {
        self.end == TurnEnd::Completed
    }

    pub fn was_cancelled(&self) -> bool {
        self.end == TurnEnd::Cancelled
    }

    pub fn error(&self) -> Option<&ChainError> {
        match &self.end {
            TurnEnd::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn spoken_text(&self) -> String {
        join(&self.spoken)
    }

    pub fn unspoken_buffer(&self) -> String {
        join(&self.unspoken)
    }
}

fn join(sentences: &[Sentence]) -> String {
    sentences
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry bounds for text streams and whole turns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Re-requests of a dropped text stream within one turn.
    pub text_source_retries: u32,
    pub text_retry_delay: Duration,
    /// Re-runs of the same host's turn after it failed.
    pub max_turn_retries: u32,
    pub turn_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            text_source_retries: 1,
            text_retry_delay: Duration::from_millis(500),
            max_turn_retries: 1,
            turn_retry_delay: Duration::from_secs(2),
        }
    }
}
