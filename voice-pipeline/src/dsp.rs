/// Sample-level helpers
///
/// Frame analysis for the reference detectors, response conditioning before
/// playback, resampling and PCM conversion.

use crate::frame::AudioSample;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid sample rate: {0} Hz (must be > 0)")]
    InvalidSampleRate(u32),

    #[error("Resampling failed: {0}")]
    Resampling(String),
}

/// Confirmation tone frequency
pub const TONE_FREQUENCY_HZ: f32 = 880.0;

/// Confirmation tone length
pub const TONE_DURATION_SECS: f32 = 0.1;

/// Confirmation tone peak amplitude
pub const TONE_AMPLITUDE: f32 = 0.3;

/// Root-mean-square energy of a frame
pub fn rms(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Zero-crossing rate (ZCR)
///
/// Fraction of adjacent sample pairs whose sign differs. Voiced speech sits
/// low, broadband noise sits high.
pub fn zero_crossing_rate(samples: &[AudioSample]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0 && pair[1] < 0.0) || (pair[0] < 0.0 && pair[1] >= 0.0))
        .count();

    crossings as f32 / (samples.len() - 1) as f32
}

/// Peak absolute amplitude
pub fn peak(samples: &[AudioSample]) -> f32 {
    samples.iter().map(|&s| s.abs()).fold(0.0f32, f32::max)
}

/// Condition an inference response for playback
///
/// Normalizes to unit peak, applies `gain`, then hard-clips to [-1, 1].
/// Silent input is returned unchanged.
pub fn prepare_response(samples: &[AudioSample], gain: f32) -> Vec<AudioSample> {
    let peak = peak(samples);
    if peak == 0.0 {
        debug!("Silent response, skipping normalization");
        return samples.to_vec();
    }

    let scale = gain / peak;
    samples
        .iter()
        .map(|&s| (s * scale).clamp(-1.0, 1.0))
        .collect()
}

/// Resample mono audio from `from_rate` to `to_rate`
pub fn resample(
    samples: &[AudioSample],
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<AudioSample>, DspError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
        WindowFunction,
    };

    if from_rate == 0 {
        return Err(DspError::InvalidSampleRate(from_rate));
    }
    if to_rate == 0 {
        return Err(DspError::InvalidSampleRate(to_rate));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    debug!("Resampling {} samples: {} Hz -> {} Hz", samples.len(), from_rate, to_rate);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        f64::from(to_rate) / f64::from(from_rate),
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| DspError::Resampling(e.to_string()))?;

    let input_waves = vec![samples.to_vec()];
    let mut output = resampler
        .process(&input_waves, None)
        .map_err(|e| DspError::Resampling(e.to_string()))?
        .pop()
        .unwrap_or_default();

    // Flush the filter tail, then drop its leading delay
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| DspError::Resampling(e.to_string()))?
        .pop()
        .unwrap_or_default();
    output.extend_from_slice(&tail);

    let delay = resampler.output_delay().min(output.len());
    output.drain(..delay);

    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    output.truncate(expected);
    Ok(output)
}

/// Short sine beep played when a recording starts
pub fn confirmation_tone(sample_rate: u32) -> Vec<AudioSample> {
    let len = (sample_rate as f32 * TONE_DURATION_SECS) as usize;
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            TONE_AMPLITUDE * (2.0 * std::f32::consts::PI * TONE_FREQUENCY_HZ * t).sin()
        })
        .collect()
}

/// Convert i16 PCM samples to f32
pub fn i16_to_f32(samples: &[i16]) -> Vec<AudioSample> {
    samples
        .iter()
        .map(|&s| s as f32 / i16::MAX as f32)
        .collect()
}

/// Convert f32 samples to i16 PCM
pub fn f32_to_i16(samples: &[AudioSample]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            (clamped * i16::MAX as f32) as i16
        })
        .collect()
}
