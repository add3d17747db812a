//! Channel mixing and sample-rate conversion.
//!
//! Synthesized clips arrive at the service's rate (commonly 24 kHz mono)
//! while output devices run at their own native rate and channel count.
//! Captured microphone audio goes the other way, down to the 16 kHz mono
//! that Whisper expects.  Both directions use the helpers here:
//!
//! 1. [`to_mono`]: downmix interleaved channels by averaging.
//! 2. [`resample_linear`]: convert between any two rates.
//! 3. [`fit_to_device`]: mono → resample → duplicate across device channels.

use crate::audio::AudioClip;

/// Sample rate expected by the STT engine.
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// ```rust
/// use voice_roundtable::audio::to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, -0.2]; // L R L R
/// let mono = to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0] - 0.0).abs() < 1e-6);
/// ```
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

/// Resample mono `samples` from `source_rate` to `target_rate` Hz using
/// linear interpolation.
///
/// ```rust
/// use voice_roundtable::audio::resample_linear;
///
/// let hi = vec![0.5_f32; 480];
/// let lo = resample_linear(&hi, 48_000, 16_000);
/// assert_eq!(lo.len(), 160);
/// ```
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else if idx < samples.len() {
            samples[idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

/// Convert `clip` into interleaved samples for a device running at
/// `rate` Hz with `channels` channels.
pub fn fit_to_device(clip: &AudioClip, rate: u32, channels: u16) -> Vec<f32> {
    let mono = to_mono(clip.samples(), clip.channels());
    let resampled = resample_linear(&mono, clip.sample_rate(), rate);

    match channels {
        0 => Vec::new(),
        1 => resampled,
        n => resampled
            .iter()
            .flat_map(|&s| std::iter::repeat(s).take(n as usize))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
