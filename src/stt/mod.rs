//! Speech-to-text for spoken interruptions.
//!
//! ```text
//! Recording::finish() ─▶ 16 kHz mono f32 ─▶ spawn_blocking(SttEngine::transcribe) ─▶ text
//! ```
//!
//! [`WhisperEngine`] is only built with the `whisper` feature; without it the
//! binary accepts typed interruptions only.

pub mod engine;
pub mod transcribe;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use engine::{check_length, SttEngine, SttError, MAX_AUDIO_SAMPLES, MIN_AUDIO_SAMPLES};
pub use transcribe::{SamplingStrategy, TranscribeParams};
#[cfg(feature = "whisper")]
pub use whisper::WhisperEngine;

#[cfg(test)]
pub use engine::MockSttEngine;
