/// Voice pipeline composition root
///
/// Builds the device, bus, bridge, engine and session once and wires them.
/// The engine and (on its first start) the session listen on the bus. The
/// engine hands new interactions to the session through a bounded channel
/// and the session reports back through `InteractionObserver`.

use crate::bridge::{BridgeStats, EventBridge};
use crate::bus::{BusStats, FrameBus};
use crate::config::PipelineConfig;
use crate::detector::{DetectorSet, GateStatus};
use crate::device::{AudioIo, DeviceInfo};
use crate::engine::{EngineState, EngineStats, Handoff, VoiceEngine};
use crate::error::Result;
use crate::events::{timestamp_micros, EventSink, VoiceEvent};
use crate::inference::InferenceBackend;
use crate::session::{
    CommandSession, InteractionObserver, InteractionOutcome, ResultCallback, SessionStatus,
    StopOutcome,
};
use crate::vad::HysteresisState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Snapshot of the whole pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub engine_state: EngineState,
    pub engine_error: Option<String>,
    pub hysteresis: HysteresisState,
    pub wake_detector: GateStatus,
    pub speech_detector: GateStatus,
    pub session: SessionStatus,
    pub engine_stats: EngineStats,
    pub bus: BusStats,
    pub bridge: BridgeStats,
    pub inference_in_flight: usize,
}

pub struct VoicePipeline {
    config: PipelineConfig,
    audio: Arc<dyn AudioIo>,
    backend: Arc<dyn InferenceBackend>,
    sinks: Vec<Arc<dyn EventSink>>,
    runtime: Handle,

    bus: Arc<FrameBus>,
    bridge: Arc<EventBridge>,
    engine: Arc<VoiceEngine>,
    session: Arc<CommandSession>,

    running: AtomicBool,
}

impl VoicePipeline {
    /// Validate the configuration and wire every component
    ///
    /// Nothing touches the audio hardware until `start`.
    pub fn new(
        config: PipelineConfig,
        audio: Arc<dyn AudioIo>,
        backend: Arc<dyn InferenceBackend>,
        detectors: DetectorSet,
        sinks: Vec<Arc<dyn EventSink>>,
        runtime: Handle,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let bus = Arc::new(FrameBus::with_preroll(
            config.preroll_frames(),
            config.device.frame_length,
            config.device.sample_rate,
        ));
        let bridge = Arc::new(EventBridge::new(config.engine.event_queue_capacity));
        bridge.attach(&runtime, sinks.clone());

        let (engine, handoff_rx) = VoiceEngine::new(
            &config,
            detectors.wake,
            detectors.speech,
            Arc::clone(&bridge),
        );
        let engine = Arc::new(engine);
        bus.register(engine.clone());

        let session = CommandSession::new(
            &config,
            Arc::clone(&audio),
            Arc::clone(&backend),
            detectors.session_speech,
            Arc::clone(&bus),
            Arc::clone(&bridge),
            runtime.clone(),
        );
        session.set_observer(engine.clone());

        spawn_handoff_loop(
            &runtime,
            handoff_rx,
            Arc::downgrade(&engine),
            Arc::downgrade(&session),
        );
        install_fault_handler(
            audio.as_ref(),
            Arc::downgrade(&engine),
            Arc::downgrade(&session),
            Arc::clone(&bridge),
        );

        info!(
            "Voice pipeline ready: {} Hz, {} samples/frame, max recording {:.1}s, backend '{}'",
            config.device.sample_rate,
            config.device.frame_length,
            config.max_recording_secs(),
            backend.name()
        );

        Ok(Arc::new(Self {
            config,
            audio,
            backend,
            sinks,
            runtime,
            bus,
            bridge,
            engine,
            session,
            running: AtomicBool::new(false),
        }))
    }

    /// Initialize detectors and open the audio streams
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Voice pipeline already running");
            return Ok(());
        }

        let (wake, speech) = self.engine.initialize_detectors();
        if wake != GateStatus::Ready {
            warn!("Wake detector unavailable; only manual triggers will start interactions");
        }
        if speech != GateStatus::Ready {
            warn!("Speech detector unavailable; treating every frame as speech");
        }

        let callback = self.bus.dispatcher().into_callback();
        if let Err(e) = self.audio.start(callback) {
            self.running.store(false, Ordering::Release);
            error!("Failed to start audio: {}", e);
            self.engine.fail(e.to_string());
            return Err(e);
        }

        info!("Voice pipeline started");
        Ok(())
    }

    /// Close the streams and abandon any interaction in progress
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.audio.stop();
        self.session.cancel();
        if let Err(e) = self.engine.reset() {
            debug!("Engine left as is on stop: {}", e);
        }
        info!("Voice pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start an interaction without waiting for the wake word
    ///
    /// Returns `Ok(false)` when an interaction is already in progress.
    pub fn trigger(&self) -> Result<bool> {
        if !self.engine.begin_manual_interaction()? {
            debug!("Interaction already in progress, ignoring trigger");
            return Ok(false);
        }

        match self.session.start() {
            Ok(started) => Ok(started),
            Err(e) => {
                self.engine
                    .on_interaction_finished(&InteractionOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// End the current recording and dispatch it
    pub fn stop_recording(&self) -> StopOutcome {
        self.session.stop()
    }

    /// Abandon the current interaction
    pub fn cancel(&self) -> bool {
        if self.session.cancel() {
            return true;
        }

        // Listening without a recording yet
        match self.engine.reset() {
            Ok(changed) => changed,
            Err(e) => {
                debug!("Nothing to cancel: {}", e);
                false
            }
        }
    }

    /// Retry detectors and leave the engine's Error state
    pub fn reinitialize(&self) -> EngineState {
        self.session.cancel();
        self.engine.reinitialize()
    }

    /// Build a replacement pipeline with a new configuration
    ///
    /// This pipeline is stopped first. The backend and sinks carry over; the
    /// caller supplies fresh detectors and, if device settings changed, a
    /// device opened with them.
    pub fn reconfigure(
        &self,
        config: PipelineConfig,
        audio: Arc<dyn AudioIo>,
        detectors: DetectorSet,
    ) -> Result<Arc<VoicePipeline>> {
        config.validate()?;
        self.stop();
        self.bridge.detach();

        info!("Reconfiguring voice pipeline");
        VoicePipeline::new(
            config,
            audio,
            Arc::clone(&self.backend),
            detectors,
            self.sinks.clone(),
            self.runtime.clone(),
        )
    }

    pub fn set_result_callback(&self, callback: ResultCallback) {
        self.session.set_result_callback(callback);
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.audio.list_devices()
    }

    pub fn status(&self) -> PipelineStatus {
        let (wake_detector, speech_detector) = self.engine.gate_status();

        PipelineStatus {
            running: self.is_running(),
            engine_state: self.engine.state(),
            engine_error: self.engine.last_error(),
            hysteresis: self.engine.hysteresis_state(),
            wake_detector,
            speech_detector,
            session: self.session.status(),
            engine_stats: self.engine.stats(),
            bus: self.bus.stats(),
            bridge: self.bridge.stats(),
            inference_in_flight: self.session.inference().in_flight(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<VoiceEngine> {
        &self.engine
    }

    pub fn session(&self) -> &Arc<CommandSession> {
        &self.session
    }

    pub fn bus(&self) -> &Arc<FrameBus> {
        &self.bus
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.stop();
        // The drain task flushes what is queued, then exits
        self.bridge.detach();
    }
}

/// Carry engine handoffs into the session on the runtime
fn spawn_handoff_loop(
    runtime: &Handle,
    mut handoffs: mpsc::Receiver<Handoff>,
    engine: Weak<VoiceEngine>,
    session: Weak<CommandSession>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        while let Some(handoff) = handoffs.recv().await {
            let (Some(engine), Some(session)) = (engine.upgrade(), session.upgrade()) else {
                break;
            };

            match handoff {
                Handoff::BeginRecording { frame } => match session.start_from(frame) {
                    Ok(true) => debug!("Recording opened for speech at frame {}", frame),
                    Ok(false) => debug!("Session already active, engine follows it"),
                    Err(e) => {
                        warn!("Could not open recording: {}", e);
                        engine.on_interaction_finished(&InteractionOutcome::Failed(e.to_string()));
                    }
                },
            }
        }
        debug!("Handoff loop finished");
    })
}

/// Device faults park the engine in Error and end the interaction
fn install_fault_handler(
    audio: &dyn AudioIo,
    engine: Weak<VoiceEngine>,
    session: Weak<CommandSession>,
    bridge: Arc<EventBridge>,
) {
    audio.set_fault_handler(Arc::new(move |message: String| {
        if let Some(session) = session.upgrade() {
            session.cancel();
        }
        if let Some(engine) = engine.upgrade() {
            engine.fail(message.clone());
        }
        bridge.publish(VoiceEvent::DeviceFault {
            message,
            timestamp_us: timestamp_micros(),
        });
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::LoopbackBackend;
    use crate::replay::ReplayAudioIo;
    use crate::session::SessionState;

    fn pipeline(config: PipelineConfig) -> Arc<VoicePipeline> {
        let audio = Arc::new(ReplayAudioIo::from_samples(
            "silence",
            Vec::new(),
            config.device.clone(),
        ));
        VoicePipeline::new(
            config,
            audio,
            Arc::new(LoopbackBackend::new()),
            DetectorSet::none(),
            Vec::new(),
            Handle::current(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.device.frame_length = 0;

        let audio = Arc::new(ReplayAudioIo::from_samples(
            "silence",
            Vec::new(),
            PipelineConfig::default().device,
        ));
        let result = VoicePipeline::new(
            config,
            audio,
            Arc::new(LoopbackBackend::new()),
            DetectorSet::none(),
            Vec::new(),
            Handle::current(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_trigger_opens_recording() {
        let pipeline = pipeline(PipelineConfig::default());

        assert!(pipeline.trigger().unwrap());
        assert_eq!(pipeline.engine().state(), EngineState::Processing);
        assert_eq!(pipeline.session().state(), SessionState::Recording);

        // Second trigger while busy
        assert!(!pipeline.trigger().unwrap());

        assert!(pipeline.cancel());
        assert_eq!(pipeline.engine().state(), EngineState::Idle);
        assert_eq!(pipeline.session().state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_status_serializes() {
        let pipeline = pipeline(PipelineConfig::default());
        let status = pipeline.status();

        assert!(!status.running);
        assert_eq!(status.engine_state, EngineState::Idle);
        assert_eq!(status.bus.listeners, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["engine_state"], "idle");
        assert_eq!(json["session"]["state"], "idle");
    }

    #[tokio::test]
    async fn test_reinitialize_leaves_error() {
        let pipeline = pipeline(PipelineConfig::default());
        pipeline.engine().fail("device unplugged");
        assert_eq!(pipeline.engine().state(), EngineState::Error);
        assert!(pipeline.trigger().is_err());

        assert_eq!(pipeline.reinitialize(), EngineState::Idle);
        assert!(pipeline.status().engine_error.is_none());
    }
}
