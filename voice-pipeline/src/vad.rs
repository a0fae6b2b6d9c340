/// Speech hysteresis
///
/// Turns raw per-frame speech verdicts into utterance boundaries. Speech
/// starts on the first speech verdict; it ends only once consecutive
/// silence has lasted longer than the configured minimum, so a single quiet
/// frame inside a word never splits an utterance.

use serde::Serialize;
use std::time::Duration;
use tracing::trace;

/// Boundary reported by a tracker update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechTransition {
    /// Nothing changed
    None,

    /// First speech frame of an utterance
    Started,

    /// Silence exceeded the minimum after speech
    Ended,
}

/// Hysteresis counters, readable by whoever owns the tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HysteresisState {
    pub speech_started: bool,
    pub silence_frames: usize,
    pub speech_frames: usize,
}

/// Speech start/end tracker
#[derive(Debug, Clone)]
pub struct HysteresisTracker {
    min_silence: Duration,
    state: HysteresisState,
}

impl HysteresisTracker {
    pub fn new(min_silence_ms: u32) -> Self {
        Self {
            min_silence: Duration::from_millis(u64::from(min_silence_ms)),
            state: HysteresisState::default(),
        }
    }

    /// Feed one verdict covering `frame_duration` of audio
    pub fn update(&mut self, is_speech: bool, frame_duration: Duration) -> SpeechTransition {
        let state = &mut self.state;

        if is_speech {
            state.silence_frames = 0;
            state.speech_frames += 1;

            if !state.speech_started {
                state.speech_started = true;
                trace!("Speech started");
                return SpeechTransition::Started;
            }
            return SpeechTransition::None;
        }

        if !state.speech_started {
            return SpeechTransition::None;
        }

        state.silence_frames += 1;
        let silence = frame_duration.saturating_mul(state.silence_frames as u32);
        trace!(
            "Silence after speech: {} frames ({:?})",
            state.silence_frames,
            silence
        );

        if silence > self.min_silence {
            trace!(
                "Speech ended after {} speech frames, {:?} silence",
                state.speech_frames, silence
            );
            *state = HysteresisState::default();
            return SpeechTransition::Ended;
        }

        SpeechTransition::None
    }

    pub fn is_speech_active(&self) -> bool {
        self.state.speech_started
    }

    pub fn state(&self) -> HysteresisState {
        self.state
    }

    pub fn min_silence(&self) -> Duration {
        self.min_silence
    }

    /// Reset counters for a new interaction
    pub fn reset(&mut self) {
        self.state = HysteresisState::default();
        trace!("Hysteresis reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{frame_duration, FRAME_LENGTH, SAMPLE_RATE};

    fn frame() -> Duration {
        frame_duration(FRAME_LENGTH, SAMPLE_RATE)
    }

    #[test]
    fn test_initial_state() {
        let tracker = HysteresisTracker::new(500);
        assert!(!tracker.is_speech_active());
        assert_eq!(tracker.state(), HysteresisState::default());
    }

    #[test]
    fn test_silence_before_speech_is_ignored() {
        let mut tracker = HysteresisTracker::new(500);
        for _ in 0..100 {
            assert_eq!(tracker.update(false, frame()), SpeechTransition::None);
        }
        assert_eq!(tracker.state().silence_frames, 0);
    }

    #[test]
    fn test_first_speech_frame_starts() {
        let mut tracker = HysteresisTracker::new(500);
        assert_eq!(tracker.update(true, frame()), SpeechTransition::Started);
        assert_eq!(tracker.update(true, frame()), SpeechTransition::None);
        assert!(tracker.is_speech_active());
        assert_eq!(tracker.state().speech_frames, 2);
    }

    #[test]
    fn test_ends_only_after_min_silence() {
        let mut tracker = HysteresisTracker::new(500);
        tracker.update(true, frame());

        // 15 frames is 480ms, not yet past 500ms
        for _ in 0..15 {
            assert_eq!(tracker.update(false, frame()), SpeechTransition::None);
        }
        assert!(tracker.is_speech_active());

        // 16th frame reaches 512ms
        assert_eq!(tracker.update(false, frame()), SpeechTransition::Ended);
        assert!(!tracker.is_speech_active());
    }

    #[test]
    fn test_single_silent_frame_does_not_end() {
        let mut tracker = HysteresisTracker::new(500);
        tracker.update(true, frame());

        for _ in 0..10 {
            assert_eq!(tracker.update(false, frame()), SpeechTransition::None);
            assert_eq!(tracker.update(true, frame()), SpeechTransition::None);
        }
        assert!(tracker.is_speech_active());
        assert_eq!(tracker.state().silence_frames, 0);
    }

    #[test]
    fn test_speech_resets_silence_count() {
        let mut tracker = HysteresisTracker::new(500);
        tracker.update(true, frame());
        for _ in 0..14 {
            tracker.update(false, frame());
        }
        tracker.update(true, frame());

        // Counting starts over
        for _ in 0..15 {
            assert_eq!(tracker.update(false, frame()), SpeechTransition::None);
        }
        assert_eq!(tracker.update(false, frame()), SpeechTransition::Ended);
    }

    #[test]
    fn test_reset() {
        let mut tracker = HysteresisTracker::new(500);
        tracker.update(true, frame());
        tracker.update(false, frame());

        tracker.reset();
        assert!(!tracker.is_speech_active());
        assert_eq!(tracker.update(true, frame()), SpeechTransition::Started);
    }
}
