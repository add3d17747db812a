//! Speech-to-text interface used for spoken interruptions.
//!
//! [`SttEngine`] is object-safe and `Send + Sync` so it can be held behind an
//! `Arc<dyn SttEngine>` and run on the blocking pool.  Every engine accepts
//! **16 kHz mono f32** audio and refuses clips that are too short, too long,
//! or that produce no words.
//!
//! [`MockSttEngine`] (available under `#[cfg(test)]`) returns a canned reply.

use thiserror::Error;

// ---------------------------------------------------------------------------
// SttError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SttError {
    /// The GGML model file was not found at the given path.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("speech-to-text initialisation failed: {0}")]
    ContextInit(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("recording too short (minimum 0.5 s)")]
    AudioTooShort,

    #[error("recording too long (maximum 60 s)")]
    AudioTooLong,

    /// The clip decoded to no words.
    #[error("could not make out any words")]
    Unintelligible,
}

// ---------------------------------------------------------------------------
// SttEngine trait
// ---------------------------------------------------------------------------

pub trait SttEngine: Send + Sync {
    /// Transcribe 16 kHz mono `audio` into trimmed, non-empty text.
    fn transcribe(&self, audio: &[f32]) -> Result<String, SttError>;
}

/// 0.5 s at 16 kHz.
pub const MIN_AUDIO_SAMPLES: usize = 8_000;
/// 60 s at 16 kHz.
pub const MAX_AUDIO_SAMPLES: usize = 960_000;

/// Length guard shared by every engine.
pub fn check_length(audio: &[f32]) -> Result<(), SttError> {
    if audio.len() < MIN_AUDIO_SAMPLES {
        return Err(SttError::AudioTooShort);
    }
    if audio.len() > MAX_AUDIO_SAMPLES {
        return Err(SttError::AudioTooLong);
    }
    Ok(())
}

/// Trim a raw transcript; blank or bracketed-noise output is unintelligible.
pub fn finish_transcript(raw: &str) -> Result<String, SttError> {
    let text = raw.trim();
    let is_noise = text.starts_with('[') && text.ends_with(']')
        || text.starts_with('(') && text.ends_with(')');
    if text.is_empty() || is_noise {
        return Err(SttError::Unintelligible);
    }
    Ok(text.to_owned())
}

// ---------------------------------------------------------------------------
// MockSttEngine  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub struct MockSttEngine {
    response: Result<String, SttError>,
}

#[cfg(test)]
impl MockSttEngine {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            response: Ok(text.into()),
        }
    }

    pub fn err(error: SttError) -> Self {
        Self {
            response: Err(error),
        }
    }
}

#[cfg(test)]
impl SttEngine for MockSttEngine {
    fn transcribe(&self, audio: &[f32]) -> Result<String, SttError> {
        check_length(audio)?;
        let raw = self.response.clone()?;
        finish_transcript(&raw)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
