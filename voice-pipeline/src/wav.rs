/// WAV file input and output (hound)

use crate::dsp::{f32_to_i16, i16_to_f32};
use crate::frame::AudioSample;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("WAV I/O failed: {0}")]
    Hound(#[from] hound::Error),

    #[error("Unsupported WAV format: {0}")]
    Unsupported(String),
}

/// Read a WAV file as mono f32, downmixing by averaging channels
///
/// Returns the samples and the file's sample rate.
pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<(Vec<AudioSample>, u32), WavError> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let interleaved: Vec<AudioSample> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, 16) => {
            let pcm: Vec<i16> = reader.samples::<i16>().collect::<Result<_, _>>()?;
            i16_to_f32(&pcm)
        }
        (format, bits) => {
            return Err(WavError::Unsupported(format!("{:?} {}-bit", format, bits)));
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect()
    };

    debug!(
        "Read {} samples from {} ({} Hz, {} channels)",
        mono.len(),
        path.display(),
        spec.sample_rate,
        channels
    );
    Ok((mono, spec.sample_rate))
}

/// Write mono samples as 16-bit PCM WAV
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[AudioSample],
    sample_rate: u32,
) -> Result<(), WavError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path.as_ref(), spec)?;
    for sample in f32_to_i16(samples) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    debug!("Wrote {} samples to {}", samples.len(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");

        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 / 1600.0) - 0.5).collect();
        write_wav(&path, &samples, 16000).unwrap();

        let (read, rate) = read_wav_mono(&path).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(read.len(), samples.len());
        assert_relative_eq!(read[100], samples[100], epsilon = 1e-3);
    }

    #[test]
    fn test_read_stereo_float_downmix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..10 {
            writer.write_sample(0.2f32).unwrap();
            writer.write_sample(0.6f32).unwrap();
        }
        writer.finalize().unwrap();

        let (read, rate) = read_wav_mono(&path).unwrap();
        assert_eq!(rate, 48000);
        assert_eq!(read.len(), 10);
        assert_relative_eq!(read[0], 0.4, epsilon = 1e-6);
    }

    #[test]
    fn test_read_missing_file() {
        assert!(read_wav_mono("/nonexistent/clip.wav").is_err());
    }
}
