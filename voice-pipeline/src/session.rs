/// Command session
///
/// Owns one interaction at a time: Idle -> Recording -> Processing ->
/// Success or Error -> (delay) -> Idle. Frames are appended on the realtime
/// thread into a buffer allocated when recording starts. Everything else
/// (stopping, inference, playback, resets) runs on the control side.
///
/// The frame path never stops a recording itself. When the buffer reaches
/// its cap an overflow flag is raised; the next frame sets `stop_requested`
/// and wakes the control task, which performs the stop.
///
/// A wake-triggered recording starts at the frame where speech began. The
/// frames between that onset and the session's first frame are copied from
/// the bus pre-roll.
///
/// Every interaction gets a generation number. Cancel and start bump it, so
/// completions and reset timers belonging to an older interaction are
/// discarded.

use crate::bridge::EventBridge;
use crate::bus::{FrameBus, FrameListener, ListenerError};
use crate::config::{PipelineConfig, SessionConfig};
use crate::detector::{SpeechDetector, SpeechGate};
use crate::device::AudioIo;
use crate::dsp::{confirmation_tone, prepare_response};
use crate::error::PipelineError;
use crate::events::{timestamp_micros, VoiceEvent};
use crate::frame::{frame_duration, AudioFrame, AudioSample};
use crate::inference::{InferenceBackend, InferenceError, InferenceOutput, InferenceWorker};
use crate::vad::{HysteresisTracker, SpeechTransition};
use crate::wav::write_wav;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Recording,
    Processing,
    Success,
    Error,
}

/// Outcome of a successful interaction, handed to the result callback
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub kind: String,
    pub status: String,
    pub recorded_frames: usize,
    pub response_samples: usize,
    pub sample_rate: u32,
    pub text: Option<String>,
}

pub type ResultCallback = Arc<dyn Fn(&CommandResult) + Send + Sync>;

/// How an interaction ended
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionOutcome {
    Completed,
    Failed(String),
    /// Too short to be worth dispatching
    Rejected { frames: usize },
    Cancelled,
    /// Result arrived after the interaction was cancelled or superseded
    Discarded,
}

/// Receives interaction progress (implemented by the engine)
pub trait InteractionObserver: Send + Sync {
    fn on_response_ready(&self);
    fn on_interaction_finished(&self, outcome: &InteractionOutcome);
}

/// What `stop` did
#[derive(Debug)]
pub enum StopOutcome {
    NotRecording,
    TooShort { frames: usize },
    /// Inference could not be dispatched; the session is in Error
    Failed(String),
    /// Processing; the handle resolves when the interaction finishes
    Dispatched(JoinHandle<InteractionOutcome>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_recording: bool,
    pub buffer_frames: usize,
    pub silence_counter: usize,
    pub speech_started: bool,
    pub overflowed: bool,
    pub interactions: u64,
    pub frames_dropped: u64,
    pub last_error: Option<String>,
}

/// Contiguous recording buffer capped at `max_frames`
struct SessionBuffer {
    samples: Vec<AudioSample>,
    frames: usize,
    max_frames: usize,
}

impl SessionBuffer {
    fn new(max_frames: usize, frame_length: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_frames * frame_length),
            frames: 0,
            max_frames,
        }
    }

    /// Append a frame; false if the buffer is already full
    fn push_frame(&mut self, frame: &[AudioSample]) -> bool {
        if self.is_full() || self.samples.len() + frame.len() > self.samples.capacity() {
            return false;
        }
        self.samples.extend_from_slice(frame);
        self.frames += 1;
        true
    }

    fn is_full(&self) -> bool {
        self.frames >= self.max_frames
    }

    fn frames(&self) -> usize {
        self.frames
    }

    fn into_samples(self) -> Vec<AudioSample> {
        self.samples
    }
}

/// State touched by the frame path
struct Recorder {
    buffer: Option<SessionBuffer>,
    speech: SpeechGate,
    hysteresis: HysteresisTracker,
    /// Sequence of the speech onset still to be filled from the pre-roll
    onset: Option<u64>,
}

pub struct CommandSession {
    config: SessionConfig,
    frame_length: usize,
    sample_rate: u32,
    output_sample_rate: u32,
    min_frames: usize,
    reset_delay: Duration,

    audio: Arc<dyn AudioIo>,
    worker: InferenceWorker,
    bridge: Arc<EventBridge>,
    bus: Arc<FrameBus>,
    runtime: Handle,

    recorder: Mutex<Recorder>,
    state: watch::Sender<SessionState>,
    control: Mutex<()>,

    recording: AtomicBool,
    overflow: AtomicBool,
    stop_requested: AtomicBool,
    registered: AtomicBool,
    generation: AtomicU64,
    stop_signal: Arc<Notify>,

    observer: RwLock<Option<Arc<dyn InteractionObserver>>>,
    on_result: RwLock<Option<ResultCallback>>,
    last_error: Mutex<Option<String>>,
    interactions: AtomicU64,
    frames_dropped: AtomicU64,

    weak_self: Weak<CommandSession>,
}

impl CommandSession {
    /// Create a session and start its control task and backend warm-up
    pub fn new(
        config: &PipelineConfig,
        audio: Arc<dyn AudioIo>,
        backend: Arc<dyn InferenceBackend>,
        speech: Option<Box<dyn SpeechDetector>>,
        bus: Arc<FrameBus>,
        bridge: Arc<EventBridge>,
        runtime: Handle,
    ) -> Arc<Self> {
        let worker = InferenceWorker::new(backend, config.session.inference_queue_depth);
        worker.spawn_warm_up(&runtime);

        let (state, _) = watch::channel(SessionState::Idle);
        let stop_signal = Arc::new(Notify::new());

        let session = Arc::new_cyclic(|weak_self: &Weak<CommandSession>| Self {
            config: config.session.clone(),
            frame_length: config.device.frame_length,
            sample_rate: config.device.sample_rate,
            output_sample_rate: config.device.output_sample_rate,
            min_frames: config.min_recording_frames(),
            reset_delay: Duration::from_millis(config.session.reset_delay_ms),
            audio,
            worker,
            bridge,
            bus,
            runtime: runtime.clone(),
            recorder: Mutex::new(Recorder {
                buffer: None,
                speech: SpeechGate::new(speech),
                hysteresis: HysteresisTracker::new(config.detector.min_silence_duration_ms),
                onset: None,
            }),
            state,
            control: Mutex::new(()),
            recording: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stop_signal: Arc::clone(&stop_signal),
            observer: RwLock::new(None),
            on_result: RwLock::new(None),
            last_error: Mutex::new(None),
            interactions: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        });

        Self::spawn_control_task(&runtime, Arc::downgrade(&session), stop_signal);
        session
    }

    /// Stops requested by the frame path are carried out here
    fn spawn_control_task(runtime: &Handle, session: Weak<CommandSession>, signal: Arc<Notify>) {
        runtime.spawn(async move {
            loop {
                signal.notified().await;
                let Some(live) = session.upgrade() else {
                    break;
                };

                if live.stop_requested.load(Ordering::Acquire) {
                    match live.stop() {
                        StopOutcome::Dispatched(_) => debug!("Automatic stop dispatched"),
                        other => debug!("Automatic stop: {:?}", other),
                    }
                }
            }
            debug!("Session control task finished");
        });
    }

    pub fn set_observer(&self, observer: Arc<dyn InteractionObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn set_result_callback(&self, callback: ResultCallback) {
        *self.on_result.write() = Some(callback);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn inference(&self) -> &InferenceWorker {
        &self.worker
    }

    /// Begin recording
    ///
    /// Returns `Ok(false)` if an interaction is already recording or processing.
    pub fn start(&self) -> Result<bool, PipelineError> {
        self.begin(None)
    }

    /// Begin recording from an already detected speech onset
    ///
    /// The recording starts with frame `onset` rather than the next frame
    /// delivered, as far back as the bus pre-roll reaches. No confirmation
    /// tone is played since the user is already talking.
    pub fn start_from(&self, onset: u64) -> Result<bool, PipelineError> {
        self.begin(Some(onset))
    }

    fn begin(&self, onset: Option<u64>) -> Result<bool, PipelineError> {
        let _control = self.control.lock();

        let state = self.state();
        if self.recording.load(Ordering::Acquire) || state == SessionState::Processing {
            debug!("Session already active ({:?}), ignoring start", state);
            return Ok(false);
        }

        self.ensure_registered();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        {
            let mut recorder = self.recorder.lock();
            recorder.speech.initialize();
            recorder.speech.reset();
            recorder.hysteresis.reset();
            recorder.buffer = Some(SessionBuffer::new(
                self.config.max_buffer_frames,
                self.frame_length,
            ));
            recorder.onset = onset;
        }
        self.overflow.store(false, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        *self.last_error.lock() = None;

        self.set_state(SessionState::Recording, None);
        self.recording.store(true, Ordering::Release);

        if self.config.confirmation_tone && onset.is_none() {
            let tone = confirmation_tone(self.output_sample_rate);
            if let Err(e) = self.audio.play_audio(&tone, self.output_sample_rate) {
                warn!("Confirmation tone failed: {}", e);
            }
        }

        info!("Recording started (interaction #{})", generation);
        Ok(true)
    }

    /// Subscribe to the bus on the first start only
    fn ensure_registered(&self) {
        if self.registered.swap(true, Ordering::AcqRel) {
            return;
        }

        self.bus.register(Arc::new(SessionTap {
            session: self.weak_self.clone(),
        }));
    }

    /// Stop recording and dispatch the utterance
    pub fn stop(&self) -> StopOutcome {
        let _control = self.control.lock();

        if !self.recording.swap(false, Ordering::AcqRel) {
            return StopOutcome::NotRecording;
        }

        let buffer = self.recorder.lock().buffer.take();
        let overflowed = self.overflow.swap(false, Ordering::AcqRel);
        self.stop_requested.store(false, Ordering::Release);
        let generation = self.generation.load(Ordering::Acquire);

        let Some(buffer) = buffer else {
            self.set_state(SessionState::Idle, None);
            return StopOutcome::NotRecording;
        };

        let frames = buffer.frames();
        if frames < self.min_frames {
            let reason = PipelineError::RecordingTooShort {
                frames,
                minimum: self.min_frames,
            };
            info!("{}, discarding", reason);
            self.set_state(SessionState::Idle, None);
            self.notify_finished(&InteractionOutcome::Rejected { frames });
            return StopOutcome::TooShort { frames };
        }

        if overflowed {
            info!(
                "{}, stopping early",
                PipelineError::BufferOverflow(self.config.max_buffer_frames)
            );
        }

        let samples = buffer.into_samples();
        info!(
            "Recording stopped: {} frames ({:.2}s)",
            frames,
            frame_duration(samples.len(), self.sample_rate).as_secs_f32()
        );

        if let Some(dir) = self.config.save_recordings_dir.clone() {
            self.save_recording(dir, samples.clone(), generation);
        }

        self.set_state(SessionState::Processing, None);

        let inference = match self.worker.submit(&self.runtime, samples, self.sample_rate) {
            Ok(inference) => inference,
            Err(e) => {
                let message = PipelineError::Inference(e).to_string();
                self.fail_locked(generation, message.clone());
                return StopOutcome::Failed(message);
            }
        };

        let session = self.weak_self.clone();
        let handle = self.runtime.spawn(async move {
            let result = inference.await;
            match session.upgrade() {
                Some(session) => session.complete(generation, frames, result).await,
                None => InteractionOutcome::Discarded,
            }
        });

        StopOutcome::Dispatched(handle)
    }

    /// Abandon the current recording or pending inference
    pub fn cancel(&self) -> bool {
        let _control = self.control.lock();

        match self.state() {
            SessionState::Recording => {
                self.recording.store(false, Ordering::Release);
                self.recorder.lock().buffer = None;
                self.overflow.store(false, Ordering::Release);
                self.stop_requested.store(false, Ordering::Release);
            }
            SessionState::Processing => {}
            state => {
                debug!("Nothing to cancel in {:?}", state);
                return false;
            }
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(SessionState::Idle, None);
        self.notify_finished(&InteractionOutcome::Cancelled);
        info!("Interaction cancelled");
        true
    }

    pub fn status(&self) -> SessionStatus {
        let (buffer_frames, hysteresis) = {
            let recorder = self.recorder.lock();
            (
                recorder.buffer.as_ref().map_or(0, SessionBuffer::frames),
                recorder.hysteresis.state(),
            )
        };

        SessionStatus {
            state: self.state(),
            is_recording: self.is_recording(),
            buffer_frames,
            silence_counter: hysteresis.silence_frames,
            speech_started: hysteresis.speech_started,
            overflowed: self.overflow.load(Ordering::Acquire),
            interactions: self.interactions.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Frame path (realtime thread)
    fn on_frame(&self, frame: &AudioFrame<'_>) -> Result<(), ListenerError> {
        if !self.recording.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.overflow.load(Ordering::Acquire) {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            self.request_stop();
            return Ok(());
        }

        let Some(mut recorder) = self.recorder.try_lock() else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ListenerError::Busy);
        };
        if recorder.buffer.is_none() {
            return Ok(());
        }

        if let Some(onset) = recorder.onset.take() {
            let missed = frame.sequence().saturating_sub(onset) as usize;
            let preroll = self.bus.preroll(missed);
            let first = frame.sequence() - (preroll.len() / self.frame_length) as u64;
            for (i, samples) in preroll.chunks_exact(self.frame_length).enumerate() {
                let earlier = AudioFrame::new(samples, frame.sample_rate(), first + i as u64);
                self.record(&mut recorder, &earlier);
            }
        }

        self.record(&mut recorder, frame);
        Ok(())
    }

    fn record(&self, recorder: &mut Recorder, frame: &AudioFrame<'_>) {
        let Some(buffer) = recorder.buffer.as_mut() else {
            return;
        };
        if buffer.is_full() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !buffer.push_frame(frame.samples()) {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        if buffer.is_full() {
            self.overflow.store(true, Ordering::Release);
        }

        let is_speech = recorder.speech.process(frame);
        let transition = recorder.hysteresis.update(is_speech, frame.duration());
        if transition == SpeechTransition::Ended && self.config.auto_stop_on_silence {
            self.request_stop();
        }
    }

    fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            self.stop_signal.notify_one();
        }
    }

    async fn complete(
        &self,
        generation: u64,
        frames: usize,
        result: Result<Result<InferenceOutput, InferenceError>, JoinError>,
    ) -> InteractionOutcome {
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.fail(generation, PipelineError::Inference(e).to_string()),
            Err(e) => return self.fail(generation, format!("Inference task failed: {}", e)),
        };

        if !self.is_current(generation) {
            debug!("Discarding result of superseded interaction #{}", generation);
            return InteractionOutcome::Discarded;
        }

        let response = prepare_response(&output.samples, self.config.makeup_gain);
        self.notify_response_ready();

        let playback = match self.audio.play_audio(&response, output.sample_rate) {
            Ok(duration) => duration,
            Err(e) => return self.fail(generation, e.to_string()),
        };

        debug!("Playing {} response samples ({:?})", response.len(), playback);
        tokio::time::sleep(playback).await;

        let result = CommandResult {
            kind: "native_audio_response".to_string(),
            status: "success".to_string(),
            recorded_frames: frames,
            response_samples: response.len(),
            sample_rate: output.sample_rate,
            text: output.text,
        };

        if !self.is_current(generation) {
            debug!("Interaction #{} cancelled during playback", generation);
            return InteractionOutcome::Discarded;
        }

        // Outside the control lock; the callback may query the session
        self.emit_result(&result);

        let _control = self.control.lock();
        if !self.is_current(generation) {
            return InteractionOutcome::Discarded;
        }

        self.interactions.fetch_add(1, Ordering::Relaxed);
        self.set_state(SessionState::Success, None);
        self.notify_finished(&InteractionOutcome::Completed);
        self.schedule_reset(generation);

        info!("Interaction #{} completed", generation);
        InteractionOutcome::Completed
    }

    fn emit_result(&self, result: &CommandResult) {
        let callback = self.on_result.read().clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                warn!("Result callback panicked");
            }
        }

        self.bridge.publish(VoiceEvent::CommandResult(result.clone()));
    }

    fn fail(&self, generation: u64, message: String) -> InteractionOutcome {
        let _control = self.control.lock();
        self.fail_locked(generation, message)
    }

    fn fail_locked(&self, generation: u64, message: String) -> InteractionOutcome {
        if !self.is_current(generation) {
            debug!("Ignoring failure of superseded interaction: {}", message);
            return InteractionOutcome::Discarded;
        }

        error!("Interaction failed: {}", message);
        *self.last_error.lock() = Some(message.clone());
        self.set_state(SessionState::Error, Some(message.clone()));

        let outcome = InteractionOutcome::Failed(message);
        self.notify_finished(&outcome);
        self.schedule_reset(generation);
        outcome
    }

    /// Success and Error fall back to Idle after the reset delay
    fn schedule_reset(&self, generation: u64) {
        let session = self.weak_self.clone();
        let delay = self.reset_delay;

        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = session.upgrade() {
                session.reset_if_current(generation);
            }
        });
    }

    fn reset_if_current(&self, generation: u64) {
        let _control = self.control.lock();
        let state = self.state();
        if self.is_current(generation)
            && matches!(state, SessionState::Success | SessionState::Error)
        {
            self.set_state(SessionState::Idle, None);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn set_state(&self, to: SessionState, message: Option<String>) {
        let from = self.state.send_replace(to);
        if from == to {
            return;
        }

        debug!("Session state: {:?} -> {:?}", from, to);
        self.bridge.publish(VoiceEvent::SessionStateChanged {
            from,
            to,
            message,
            timestamp_us: timestamp_micros(),
        });
    }

    fn notify_response_ready(&self) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_response_ready();
        }
    }

    fn notify_finished(&self, outcome: &InteractionOutcome) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_interaction_finished(outcome);
        }
    }

    fn save_recording(&self, dir: PathBuf, samples: Vec<AudioSample>, generation: u64) {
        let sample_rate = self.sample_rate;
        self.runtime.spawn_blocking(move || {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!("Cannot create recordings directory {}: {}", dir.display(), e);
                return;
            }

            let path = dir.join(format!(
                "recording-{}-{}.wav",
                timestamp_micros() / 1000,
                generation
            ));
            match write_wav(&path, &samples, sample_rate) {
                Ok(()) => debug!("Saved recording to {}", path.display()),
                Err(e) => warn!("Failed to save recording {}: {}", path.display(), e),
            }
        });
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        // Wake the control task so it sees the session is gone
        self.stop_signal.notify_one();
    }
}

/// Bus listener feeding the session; weak so the bus does not keep it alive
struct SessionTap {
    session: Weak<CommandSession>,
}

impl FrameListener for SessionTap {
    fn name(&self) -> &str {
        "command-session"
    }

    fn on_frame(&self, frame: &AudioFrame<'_>) -> Result<(), ListenerError> {
        match self.session.upgrade() {
            Some(session) => session.on_frame(frame),
            None => Ok(()),
        }
    }
}
