//! Decoded audio clips.
//!
//! The synthesis service returns raw little-endian 16-bit PCM.  [`AudioClip`]
//! holds the decoded `f32` samples together with their rate and channel
//! count; it is what the dispatcher caches and what an
//! [`AudioOutput`](crate::audio::AudioOutput) plays.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// PcmFormat
// ---------------------------------------------------------------------------

/// Layout of raw PCM bytes returned by the synthesis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioError
// ---------------------------------------------------------------------------

/// Reason synthesized bytes could not be turned into a playable clip.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AudioError {
    /// The service returned no audio at all.
    #[error("synthesized audio is empty")]
    Empty,

    /// The byte count is not a whole number of 16-bit frames.
    #[error("truncated PCM: {len} bytes is not a multiple of {frame} bytes per frame")]
    Truncated { len: usize, frame: usize },

    /// The declared format cannot describe real audio.
    #[error("invalid PCM format: {0}")]
    InvalidFormat(String),
}

// ---------------------------------------------------------------------------
// AudioClip
// ---------------------------------------------------------------------------

/// Interleaved `f32` samples in `[-1.0, 1.0]` plus their format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioClip {
    /// Wrap already-decoded samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Decode little-endian signed 16-bit PCM.
    ///
    /// ```
    /// use voice_roundtable::audio::{AudioClip, PcmFormat};
    ///
    /// let bytes = [0x00, 0x40, 0x00, 0xC0]; // +0.5, -0.5
    /// let clip = AudioClip::decode_pcm16(&bytes, PcmFormat::default()).unwrap();
    /// assert_eq!(clip.samples(), &[0.5, -0.5]);
    /// ```
    pub fn decode_pcm16(bytes: &[u8], format: PcmFormat) -> Result<Self, AudioError> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::InvalidFormat(format!(
                "{} Hz, {} channels",
                format.sample_rate, format.channels
            )));
        }
        if bytes.is_empty() {
            return Err(AudioError::Empty);
        }

        let frame = 2 * format.channels as usize;
        if bytes.len() % frame != 0 {
            return Err(AudioError::Truncated {
                len: bytes.len(),
                frame,
            });
        }

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
            .collect();

        Ok(Self::new(samples, format.sample_rate, format.channels))
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback length at the clip's own sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
