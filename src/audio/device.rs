//! Speaker output and microphone recording via `cpal`.
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream lives on a
//! dedicated thread that owns it until the Rust-side handle is dropped.  The
//! async side only touches shared sample buffers.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::audio::resample::{fit_to_device, resample_linear, to_mono, STT_SAMPLE_RATE};
use crate::audio::{AudioClip, AudioOutput, PlaybackEnd, PlaybackError};

// ---------------------------------------------------------------------------
// DeviceError
// ---------------------------------------------------------------------------

/// Errors that can occur while opening or running a device stream.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no output device found on the default audio host")]
    NoOutputDevice,

    #[error("no input device found on the default audio host")]
    NoInputDevice,

    #[error("failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("audio thread failed: {0}")]
    Thread(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OutputQueue {
    samples: VecDeque<f32>,
    drained: Option<oneshot::Sender<()>>,
}

/// Default speaker, kept open for the lifetime of the value.
pub struct CpalOutput {
    queue: Arc<Mutex<OutputQueue>>,
    sample_rate: u32,
    channels: u16,
    _keepalive: Mutex<mpsc::Sender<()>>,
}

impl CpalOutput {
    /// Open the default output device at its preferred configuration.
    pub fn open() -> Result<Self, DeviceError> {
        let queue = Arc::new(Mutex::new(OutputQueue::default()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u16), DeviceError>>();
        let (keepalive_tx, keepalive_rx) = mpsc::channel::<()>();

        let thread_queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match open_output_stream(thread_queue) {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    // Returns once the CpalOutput (and its sender) is dropped.
                    let _ = keepalive_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| DeviceError::Thread("audio-output thread exited early".into()))??;

        log::info!("audio: speaker open ({sample_rate} Hz, {channels} ch)");

        Ok(Self {
            queue,
            sample_rate,
            channels,
            _keepalive: Mutex::new(keepalive_tx),
        })
    }

    fn silence(&self) {
        let mut queue = lock(&self.queue);
        queue.samples.clear();
        queue.drained = None;
    }
}

/// Clears the device queue if playback is abandoned before it finished.
struct SilenceOnDrop<'a> {
    output: &'a CpalOutput,
    armed: bool,
}

impl Drop for SilenceOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.output.silence();
        }
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn play(
        &self,
        clip: &AudioClip,
        cancel: &CancellationToken,
    ) -> Result<PlaybackEnd, PlaybackError> {
        let samples = fit_to_device(clip, self.sample_rate, self.channels);
        if samples.is_empty() {
            return Ok(PlaybackEnd::Finished);
        }

        let (drained_tx, drained_rx) = oneshot::channel();
        {
            let mut queue = lock(&self.queue);
            queue.samples.clear();
            queue.samples.extend(samples);
            queue.drained = Some(drained_tx);
        }

        let mut guard = SilenceOnDrop {
            output: self,
            armed: true,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(PlaybackEnd::Stopped),
            drained = drained_rx => match drained {
                Ok(()) => {
                    guard.armed = false;
                    Ok(PlaybackEnd::Finished)
                }
                Err(_) => Err(PlaybackError::Closed),
            },
        };
        drop(guard);
        result
    }
}

fn open_output_stream(
    queue: Arc<Mutex<OutputQueue>>,
) -> Result<(cpal::Stream, u32, u16), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoOutputDevice)?;

    let supported = device.default_output_config()?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let stream = match format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, queue)?,
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, queue)?,
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, queue)?,
        other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    };

    stream.play()?;
    Ok((stream, sample_rate, channels))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<Mutex<OutputQueue>>,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = lock(&queue);
            for slot in data.iter_mut() {
                let sample = queue.samples.pop_front().unwrap_or(0.0);
                *slot = T::from_sample(sample);
            }
            if queue.samples.is_empty() {
                if let Some(drained) = queue.drained.take() {
                    let _ = drained.send(());
                }
            }
        },
        |err: cpal::StreamError| {
            log::error!("cpal output stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// MicRecorder
// ---------------------------------------------------------------------------

/// Records from the default input device for spoken interruptions.
pub struct MicRecorder;

/// An in-progress recording. Call [`Recording::finish`] to stop and collect
/// 16 kHz mono samples for the STT engine.
pub struct Recording {
    samples: Arc<Mutex<Vec<f32>>>,
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    sample_rate: u32,
    channels: u16,
}

impl MicRecorder {
    /// Start capturing from the default input device.
    pub fn start() -> Result<Recording, DeviceError> {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u16), DeviceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_samples = Arc::clone(&samples);
        let thread = std::thread::Builder::new()
            .name("audio-input".into())
            .spawn(move || match open_input_stream(thread_samples) {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| DeviceError::Thread("audio-input thread exited early".into()))??;

        Ok(Recording {
            samples,
            stop_tx,
            thread,
            sample_rate,
            channels,
        })
    }
}

impl Recording {
    /// Stop the stream and return the captured audio as 16 kHz mono.
    pub fn finish(self) -> Vec<f32> {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            log::warn!("audio: input thread panicked");
        }
        let raw = std::mem::take(&mut *lock(&self.samples));
        let mono = to_mono(&raw, self.channels);
        resample_linear(&mono, self.sample_rate, STT_SAMPLE_RATE)
    }
}

fn open_input_stream(
    samples: Arc<Mutex<Vec<f32>>>,
) -> Result<(cpal::Stream, u32, u16), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(DeviceError::NoInputDevice)?;

    let supported = device.default_input_config()?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config: cpal::StreamConfig = supported.into();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            lock(&samples).extend_from_slice(data);
        },
        |err: cpal::StreamError| {
            log::error!("cpal input stream error: {err}");
        },
        None,
    )?;

    stream.play()?;
    Ok((stream, sample_rate, channels))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
