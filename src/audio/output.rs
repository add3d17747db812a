//! Audio output interface and the single playback slot.
//!
//! Every clip in the system is played through one [`PlaybackSlot`].  The slot
//! serialises playback so at most one clip is ever requested to play at a
//! time, no matter how many dispatchers exist, and reports whether audio is
//! currently playing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioClip;

// ---------------------------------------------------------------------------
// PlaybackEnd / PlaybackError
// ---------------------------------------------------------------------------

/// How a call to [`AudioOutput::play`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The whole clip was handed to the device.
    Finished,
    /// Playback was stopped early because cancellation fired.
    Stopped,
}

/// Errors raised while playing a clip.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlaybackError {
    /// The device rejected the clip or is unavailable.
    #[error("audio device error: {0}")]
    Device(String),

    /// The output stream went away while the clip was playing.
    #[error("audio output stream closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// AudioOutput trait
// ---------------------------------------------------------------------------

/// An audio sink able to play one clip at a time.
///
/// Implementations must stop producing sound promptly once `cancel` fires and
/// then return `Ok(PlaybackEnd::Stopped)`.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(
        &self,
        clip: &AudioClip,
        cancel: &CancellationToken,
    ) -> Result<PlaybackEnd, PlaybackError>;
}

// ---------------------------------------------------------------------------
// PlaybackSlot
// ---------------------------------------------------------------------------

/// Exclusive access to the shared audio output.
pub struct PlaybackSlot {
    output: Arc<dyn AudioOutput>,
    gate: Mutex<()>,
    playing: AtomicBool,
}

impl PlaybackSlot {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            gate: Mutex::new(()),
            playing: AtomicBool::new(false),
        }
    }

    /// Wait for the slot, call `on_start`, then play `clip`.
    ///
    /// Returns `Stopped` without calling `on_start` when `cancel` fires while
    /// waiting for the slot.
    pub async fn play<F>(
        &self,
        clip: &AudioClip,
        cancel: &CancellationToken,
        on_start: F,
    ) -> Result<PlaybackEnd, PlaybackError>
    where
        F: FnOnce() + Send,
    {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PlaybackEnd::Stopped),
            guard = self.gate.lock() => guard,
        };

        self.playing.store(true, Ordering::SeqCst);
        on_start();
        let result = self.output.play(clip, cancel).await;
        self.playing.store(false, Ordering::SeqCst);
        result
    }

    /// `true` while a clip is being played.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// SilentOutput
// ---------------------------------------------------------------------------

/// Output that produces no sound but takes as long as the clip would.
///
/// Used for headless runs and whenever no device is available, so captions
/// and turn pacing behave as they would with a speaker attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

#[async_trait]
impl AudioOutput for SilentOutput {
    async fn play(
        &self,
        clip: &AudioClip,
        cancel: &CancellationToken,
    ) -> Result<PlaybackEnd, PlaybackError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(PlaybackEnd::Stopped),
            _ = tokio::time::sleep(clip.duration()) => Ok(PlaybackEnd::Finished),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
