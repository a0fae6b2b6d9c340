/// Audio frame type shared by every stage of the pipeline
///
/// A frame borrows its samples from whoever produced it (the device
/// callback's scratch buffer, a test vector) so delivering a frame never
/// allocates.

use std::time::Duration;

/// Audio sample format (mono f32 normalized to -1.0 to 1.0)
pub type AudioSample = f32;

/// Default capture sample rate (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame length: 512 samples, ~32ms at 16kHz
pub const FRAME_LENGTH: usize = 512;

/// Fixed-size block of mono samples delivered at a regular cadence
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame<'a> {
    samples: &'a [AudioSample],
    sample_rate: u32,
    sequence: u64,
}

impl<'a> AudioFrame<'a> {
    pub fn new(samples: &'a [AudioSample], sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
        }
    }

    pub fn samples(&self) -> &'a [AudioSample] {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Position of this frame in the device's stream (starts at 0)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wall-clock duration covered by this frame
    pub fn duration(&self) -> Duration {
        frame_duration(self.samples.len(), self.sample_rate)
    }
}

/// Duration of `frame_length` samples at `sample_rate`
pub fn frame_duration(frame_length: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frame_length as f64 / f64::from(sample_rate))
}

/// Number of whole frames covering `millis` milliseconds
pub fn frames_for_millis(millis: u64, sample_rate: u32, frame_length: usize) -> u64 {
    if frame_length == 0 {
        return 0;
    }
    millis * u64::from(sample_rate) / 1000 / frame_length as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_duration() {
        let samples = vec![0.0; FRAME_LENGTH];
        let frame = AudioFrame::new(&samples, SAMPLE_RATE, 7);

        assert_eq!(frame.len(), 512);
        assert_eq!(frame.sequence(), 7);
        assert_relative_eq!(frame.duration().as_secs_f64(), 0.032, epsilon = 1e-9);
    }

    #[test]
    fn test_frames_for_millis() {
        // 500ms at 16kHz with 512-sample frames (truncating)
        assert_eq!(frames_for_millis(500, SAMPLE_RATE, FRAME_LENGTH), 15);
        assert_eq!(frames_for_millis(1000, SAMPLE_RATE, 0), 0);
    }

    #[test]
    fn test_zero_sample_rate() {
        assert_eq!(frame_duration(512, 0), Duration::ZERO);
    }
}
