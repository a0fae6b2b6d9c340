/// Voice engine state machine
///
/// Idle -> Listening on a wake verdict, Listening -> Processing when speech
/// starts, Processing -> PlayingResponse when the session has a response,
/// back to Idle when the interaction finishes. Error is reachable from any
/// state and only `reinitialize` leaves it.
///
/// Frames arrive on the realtime thread. The core is taken with `try_lock`
/// there; if the control side holds it, the frame is skipped and counted.

use crate::bridge::EventBridge;
use crate::bus::{FrameListener, ListenerError};
use crate::config::PipelineConfig;
use crate::detector::{GateStatus, SpeechDetector, SpeechGate, WakeDetector, WakeGate};
use crate::error::{PipelineError, Result};
use crate::events::{timestamp_micros, VoiceEvent};
use crate::frame::{frames_for_millis, AudioFrame};
use crate::session::{InteractionObserver, InteractionOutcome};
use crate::vad::{HysteresisState, HysteresisTracker, SpeechTransition};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Listening,
    Processing,
    PlayingResponse,
    Error,
}

impl EngineState {
    /// Whether `self -> next` is a defined edge (same-state requests excluded)
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;

        matches!(
            (self, next),
            (_, Error)
                | (Idle, Listening)
                | (Listening, Processing)
                | (Listening, Idle)
                | (Processing, PlayingResponse)
                | (Processing, Idle)
                | (PlayingResponse, Idle)
        )
    }
}

/// Request from the engine to the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Speech started while listening; open a recording
    BeginRecording { frame: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub wake_detections: u64,
    pub transitions: u64,
    pub debounced: u64,
    pub handoffs_dropped: u64,
}

struct EngineCore {
    state: EngineState,
    last_change: Instant,
    wake: WakeGate,
    speech: SpeechGate,
    hysteresis: HysteresisTracker,
    listening_frames: u64,
    last_error: Option<String>,
}

pub struct VoiceEngine {
    core: Mutex<EngineCore>,
    cooldown: Duration,
    listen_timeout_frames: u64,
    bridge: Arc<EventBridge>,
    handoff: mpsc::Sender<Handoff>,
    frames_processed: AtomicU64,
    frames_skipped: AtomicU64,
    wake_detections: AtomicU64,
    transitions: AtomicU64,
    debounced: AtomicU64,
    handoffs_dropped: AtomicU64,
}

impl VoiceEngine {
    /// Create the engine and the receiving end of its handoff channel
    pub fn new(
        config: &PipelineConfig,
        wake: Option<Box<dyn WakeDetector>>,
        speech: Option<Box<dyn SpeechDetector>>,
        bridge: Arc<EventBridge>,
    ) -> (Self, mpsc::Receiver<Handoff>) {
        let (handoff, handoff_rx) = mpsc::channel(config.engine.handoff_capacity.max(1));

        let listen_timeout_frames = frames_for_millis(
            config.engine.listen_timeout_ms,
            config.device.sample_rate,
            config.device.frame_length,
        );

        let core = EngineCore {
            state: EngineState::Idle,
            last_change: Instant::now(),
            wake: WakeGate::new(wake),
            speech: SpeechGate::new(speech),
            hysteresis: HysteresisTracker::new(config.detector.min_silence_duration_ms),
            listening_frames: 0,
            last_error: None,
        };

        let engine = Self {
            core: Mutex::new(core),
            cooldown: Duration::from_millis(config.engine.debounce_cooldown_ms),
            listen_timeout_frames,
            bridge,
            handoff,
            frames_processed: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            wake_detections: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            debounced: AtomicU64::new(0),
            handoffs_dropped: AtomicU64::new(0),
        };

        (engine, handoff_rx)
    }

    /// Initialize detectors on the control side, before frames flow
    pub fn initialize_detectors(&self) -> (GateStatus, GateStatus) {
        let mut core = self.core.lock();
        let wake = core.wake.initialize();
        let speech = core.speech.initialize();
        info!("Detectors initialized: wake={:?}, speech={:?}", wake, speech);
        (wake, speech)
    }

    pub fn state(&self) -> EngineState {
        self.core.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.core.lock().last_error.clone()
    }

    pub fn hysteresis_state(&self) -> HysteresisState {
        self.core.lock().hysteresis.state()
    }

    pub fn gate_status(&self) -> (GateStatus, GateStatus) {
        let core = self.core.lock();
        (core.wake.status(), core.speech.status())
    }

    /// Move to `to`
    ///
    /// Returns `Ok(false)` when a same-state request falls inside the
    /// debounce window.
    pub fn request_transition(&self, to: EngineState) -> Result<bool> {
        let mut core = self.core.lock();
        self.transition(&mut core, to)
    }

    /// Manual trigger: skip wake and speech detection
    ///
    /// Returns `Ok(false)` if an interaction is already in progress.
    pub fn begin_manual_interaction(&self) -> Result<bool> {
        let mut core = self.core.lock();
        match core.state {
            EngineState::Idle => {
                self.transition(&mut core, EngineState::Listening)?;
                self.transition(&mut core, EngineState::Processing)?;
                Ok(true)
            }
            EngineState::Listening => {
                self.transition(&mut core, EngineState::Processing)?;
                Ok(true)
            }
            EngineState::Processing | EngineState::PlayingResponse => Ok(false),
            EngineState::Error => Err(PipelineError::InvalidTransition {
                from: EngineState::Error,
                to: EngineState::Listening,
            }),
        }
    }

    /// Enter Error after an unrecoverable fault
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Voice engine fault: {}", message);

        let mut core = self.core.lock();
        core.last_error = Some(message);
        if core.state != EngineState::Error {
            // Every state may move to Error
            let _ = self.transition(&mut core, EngineState::Error);
        }
    }

    /// Retry detector initialization and return to Idle
    pub fn reinitialize(&self) -> EngineState {
        let mut core = self.core.lock();
        let wake = core.wake.reinitialize();
        let speech = core.speech.reinitialize();
        core.hysteresis.reset();
        core.listening_frames = 0;
        core.last_error = None;

        let from = core.state;
        if from != EngineState::Idle {
            self.apply(&mut core, from, EngineState::Idle);
        }

        info!(
            "Voice engine reinitialized (wake={:?}, speech={:?})",
            wake, speech
        );
        core.state
    }

    /// Abandon the current interaction; Error needs `reinitialize`
    pub fn reset(&self) -> Result<bool> {
        let mut core = self.core.lock();
        match core.state {
            EngineState::Idle => Ok(false),
            EngineState::Error => Err(PipelineError::InvalidTransition {
                from: EngineState::Error,
                to: EngineState::Idle,
            }),
            _ => self.transition(&mut core, EngineState::Idle),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            wake_detections: self.wake_detections.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            debounced: self.debounced.load(Ordering::Relaxed),
            handoffs_dropped: self.handoffs_dropped.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, core: &mut EngineCore, to: EngineState) -> Result<bool> {
        let from = core.state;

        if from == to {
            if core.last_change.elapsed() < self.cooldown {
                self.debounced.fetch_add(1, Ordering::Relaxed);
                trace!("Debounced {:?} -> {:?}", from, to);
                return Ok(false);
            }
        } else if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }

        self.apply(core, from, to);
        Ok(true)
    }

    fn apply(&self, core: &mut EngineCore, from: EngineState, to: EngineState) {
        core.state = to;
        core.last_change = Instant::now();

        if to == EngineState::Listening {
            core.wake.reset();
            core.speech.reset();
            core.hysteresis.reset();
            core.listening_frames = 0;
        }

        self.transitions.fetch_add(1, Ordering::Relaxed);
        trace!("Engine state: {:?} -> {:?}", from, to);

        self.bridge.publish(VoiceEvent::EngineStateChanged {
            from,
            to,
            timestamp_us: timestamp_micros(),
        });
    }

    fn process_frame(&self, core: &mut EngineCore, frame: &AudioFrame<'_>) {
        match core.state {
            EngineState::Idle => {
                if core.wake.process(frame) {
                    self.wake_detections.fetch_add(1, Ordering::Relaxed);
                    trace!("Wake word detected on frame {}", frame.sequence());

                    self.bridge.publish(VoiceEvent::WakeDetected {
                        timestamp_us: timestamp_micros(),
                        frame: frame.sequence(),
                    });
                    let _ = self.transition(core, EngineState::Listening);
                }
            }

            EngineState::Listening => {
                core.listening_frames += 1;
                let is_speech = core.speech.process(frame);

                match core.hysteresis.update(is_speech, frame.duration()) {
                    SpeechTransition::Started => {
                        let _ = self.transition(core, EngineState::Processing);
                        let request = Handoff::BeginRecording {
                            frame: frame.sequence(),
                        };
                        if self.handoff.try_send(request).is_err() {
                            self.handoffs_dropped.fetch_add(1, Ordering::Relaxed);
                            warn!("Handoff queue unavailable, abandoning interaction");
                            let _ = self.transition(core, EngineState::Idle);
                        }
                    }
                    _ => {
                        if self.listen_timeout_frames > 0
                            && core.listening_frames >= self.listen_timeout_frames
                        {
                            trace!(
                                "No speech after {} frames, returning to idle",
                                core.listening_frames
                            );
                            let _ = self.transition(core, EngineState::Idle);
                        }
                    }
                }
            }

            // The session owns the frames until the interaction finishes
            EngineState::Processing | EngineState::PlayingResponse | EngineState::Error => {}
        }
    }
}

impl FrameListener for VoiceEngine {
    fn name(&self) -> &str {
        "voice-engine"
    }

    fn on_frame(&self, frame: &AudioFrame<'_>) -> std::result::Result<(), ListenerError> {
        let Some(mut core) = self.core.try_lock() else {
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return Err(ListenerError::Busy);
        };

        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.process_frame(&mut core, frame);
        Ok(())
    }
}

impl InteractionObserver for VoiceEngine {
    fn on_response_ready(&self) {
        let mut core = self.core.lock();
        if core.state == EngineState::Processing {
            let _ = self.transition(&mut core, EngineState::PlayingResponse);
        }
    }

    fn on_interaction_finished(&self, outcome: &InteractionOutcome) {
        let mut core = self.core.lock();
        match core.state {
            EngineState::Processing | EngineState::PlayingResponse => {
                debug!("Interaction finished: {:?}", outcome);
                let _ = self.transition(&mut core, EngineState::Idle);
            }
            state => trace!("Ignoring interaction outcome in {:?}", state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use std::sync::atomic::AtomicBool;

    /// Wake detector driven by a shared flag
    struct FlagWake(Arc<AtomicBool>);

    impl WakeDetector for FlagWake {
        fn name(&self) -> &str {
            "flag"
        }
        fn process(&mut self, _frame: &AudioFrame<'_>) -> std::result::Result<bool, DetectorError> {
            Ok(self.0.swap(false, Ordering::SeqCst))
        }
    }

    /// Speech verdict follows the frame's first sample
    struct LoudSpeech;

    impl SpeechDetector for LoudSpeech {
        fn name(&self) -> &str {
            "loud"
        }
        fn process(&mut self, frame: &AudioFrame<'_>) -> std::result::Result<bool, DetectorError> {
            Ok(frame.samples().first().copied().unwrap_or(0.0) > 0.1)
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.engine.debounce_cooldown_ms = 50;
        config.engine.listen_timeout_ms = 320; // 10 frames
        config
    }

    fn engine_with(
        config: &PipelineConfig,
        wake: Arc<AtomicBool>,
    ) -> (VoiceEngine, mpsc::Receiver<Handoff>) {
        VoiceEngine::new(
            config,
            Some(Box::new(FlagWake(wake))),
            Some(Box::new(LoudSpeech)),
            Arc::new(EventBridge::new(64)),
        )
    }

    fn feed(engine: &VoiceEngine, value: f32, count: usize) {
        let samples = vec![value; 512];
        for i in 0..count {
            engine
                .on_frame(&AudioFrame::new(&samples, 16000, i as u64))
                .unwrap();
        }
    }

    #[test]
    fn test_transition_table() {
        use EngineState::*;

        assert!(Idle.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Processing));
        assert!(Processing.can_transition_to(PlayingResponse));
        assert!(PlayingResponse.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Error));
        assert!(PlayingResponse.can_transition_to(Error));

        assert!(!Idle.can_transition_to(Processing));
        assert!(!Idle.can_transition_to(PlayingResponse));
        assert!(!Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Listening));
    }

    #[test]
    fn test_idle_stays_idle_without_wake() {
        let wake = Arc::new(AtomicBool::new(false));
        let (engine, _rx) = engine_with(&config(), wake);

        feed(&engine, 0.5, 100);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.stats().frames_processed, 100);
        assert_eq!(engine.stats().transitions, 0);
    }

    #[test]
    fn test_wake_then_speech_hands_off() {
        let wake = Arc::new(AtomicBool::new(false));
        let (engine, mut rx) = engine_with(&config(), wake.clone());

        wake.store(true, Ordering::SeqCst);
        feed(&engine, 0.0, 1);
        assert_eq!(engine.state(), EngineState::Listening);
        assert_eq!(engine.stats().wake_detections, 1);

        feed(&engine, 0.0, 3);
        assert_eq!(engine.state(), EngineState::Listening);

        feed(&engine, 0.5, 1);
        assert_eq!(engine.state(), EngineState::Processing);
        assert!(matches!(rx.try_recv(), Ok(Handoff::BeginRecording { .. })));
    }

    /// Collects formatted log output
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_path_logs_only_at_trace() {
        let wake = Arc::new(AtomicBool::new(false));
        let (engine, mut rx) = engine_with(&config(), wake.clone());
        engine.initialize_detectors();

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            wake.store(true, Ordering::SeqCst);
            feed(&engine, 0.0, 1);
            feed(&engine, 0.5, 3);
        });

        assert_eq!(engine.state(), EngineState::Processing);
        assert!(matches!(rx.try_recv(), Ok(Handoff::BeginRecording { .. })));
        // Wake, speech onset and both transitions ran without a debug line
        let output = String::from_utf8_lossy(&captured.0.lock()).to_string();
        assert!(output.is_empty(), "unexpected frame-path logging: {}", output);
    }

    #[test]
    fn test_listen_timeout_returns_to_idle() {
        let wake = Arc::new(AtomicBool::new(true));
        let (engine, mut rx) = engine_with(&config(), wake);

        feed(&engine, 0.0, 1);
        assert_eq!(engine.state(), EngineState::Listening);

        feed(&engine, 0.0, 10);
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_handoff_abandons_interaction() {
        let wake = Arc::new(AtomicBool::new(true));
        let (engine, rx) = engine_with(&config(), wake);
        drop(rx);

        feed(&engine, 0.0, 1);
        feed(&engine, 0.5, 1);

        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.stats().handoffs_dropped, 1);
    }

    #[test]
    fn test_debounce_same_state() {
        let mut config = config();
        config.engine.debounce_cooldown_ms = 60_000;
        let (engine, _rx) = engine_with(&config, Arc::new(AtomicBool::new(false)));

        assert!(engine.request_transition(EngineState::Listening).unwrap());
        assert!(!engine.request_transition(EngineState::Listening).unwrap());

        let stats = engine.stats();
        assert_eq!(stats.transitions, 1);
        assert_eq!(stats.debounced, 1);
    }

    #[test]
    fn test_reentry_after_cooldown_resets_hysteresis() {
        let (engine, _rx) = engine_with(&config(), Arc::new(AtomicBool::new(false)));
        engine.request_transition(EngineState::Listening).unwrap();

        {
            let mut core = engine.core.lock();
            core.hysteresis.update(true, Duration::from_millis(32));
        }
        assert!(engine.hysteresis_state().speech_started);

        std::thread::sleep(Duration::from_millis(80));
        assert!(engine.request_transition(EngineState::Listening).unwrap());
        assert!(!engine.hysteresis_state().speech_started);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (engine, _rx) = engine_with(&config(), Arc::new(AtomicBool::new(false)));
        let result = engine.request_transition(EngineState::PlayingResponse);

        assert!(matches!(
            result,
            Err(PipelineError::InvalidTransition {
                from: EngineState::Idle,
                to: EngineState::PlayingResponse
            })
        ));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_error_requires_reinitialize() {
        let (engine, _rx) = engine_with(&config(), Arc::new(AtomicBool::new(false)));
        engine.request_transition(EngineState::Listening).unwrap();

        engine.fail("device lost");
        assert_eq!(engine.state(), EngineState::Error);
        assert_eq!(engine.last_error().as_deref(), Some("device lost"));

        assert!(engine.reset().is_err());
        assert!(engine.begin_manual_interaction().is_err());

        // Frames are ignored while in Error
        feed(&engine, 0.5, 5);
        assert_eq!(engine.state(), EngineState::Error);

        assert_eq!(engine.reinitialize(), EngineState::Idle);
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn test_manual_interaction() {
        let (engine, _rx) = engine_with(&config(), Arc::new(AtomicBool::new(false)));

        assert!(engine.begin_manual_interaction().unwrap());
        assert_eq!(engine.state(), EngineState::Processing);
        assert!(!engine.begin_manual_interaction().unwrap());
    }

    #[test]
    fn test_observer_drives_playback_and_idle() {
        let (engine, _rx) = engine_with(&config(), Arc::new(AtomicBool::new(false)));
        engine.begin_manual_interaction().unwrap();

        engine.on_response_ready();
        assert_eq!(engine.state(), EngineState::PlayingResponse);

        engine.on_interaction_finished(&InteractionOutcome::Completed);
        assert_eq!(engine.state(), EngineState::Idle);

        // Outcomes outside an interaction are ignored
        engine.on_interaction_finished(&InteractionOutcome::Cancelled);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_contended_frame_is_skipped() {
        let (engine, _rx) = engine_with(&config(), Arc::new(AtomicBool::new(true)));
        let samples = vec![0.0; 512];

        let held = engine.core.lock();
        let result = engine.on_frame(&AudioFrame::new(&samples, 16000, 0));
        drop(held);

        assert!(matches!(result, Err(ListenerError::Busy)));
        assert_eq!(engine.stats().frames_skipped, 1);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_missing_wake_detector_never_triggers() {
        let (engine, _rx) = VoiceEngine::new(
            &config(),
            None,
            None,
            Arc::new(EventBridge::new(8)),
        );

        feed(&engine, 0.9, 50);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.gate_status().0, GateStatus::Unavailable);
    }
}
