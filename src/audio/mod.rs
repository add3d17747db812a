//! Audio side of the engine: decoded clips, format conversion, and the
//! single output slot every clip is played through.
//!
//! # Flow
//!
//! ```text
//! synthesis bytes → AudioClip::decode_pcm16 → PlaybackSlot::play
//!                                               └─▶ AudioOutput (CpalOutput | SilentOutput)
//! microphone → MicRecorder → Recording::finish → 16 kHz mono → STT
//! ```

pub mod clip;
#[cfg(feature = "device")]
pub mod device;
pub mod output;
pub mod resample;

pub use clip::{AudioClip, AudioError, PcmFormat};
#[cfg(feature = "device")]
pub use device::{CpalOutput, DeviceError, MicRecorder, Recording};
pub use output::{AudioOutput, PlaybackEnd, PlaybackError, PlaybackSlot, SilentOutput};
pub use resample::{fit_to_device, resample_linear, to_mono, STT_SAMPLE_RATE};
