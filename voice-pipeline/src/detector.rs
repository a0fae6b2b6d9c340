/// Wake and speech detector capabilities
///
/// Detectors are optional and may fail to initialize. Each one sits behind a
/// gate that initializes lazily and decides what a missing detector means:
/// the wake gate fails closed (never triggers), the speech gate fails open
/// (every frame counts as speech).

use crate::config::DetectorConfig;
use crate::dsp::{rms, zero_crossing_rate};
use crate::frame::AudioFrame;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug, Clone)]
pub enum DetectorError {
    #[error("Detector initialization failed: {0}")]
    Init(String),

    #[error("Detection error: {0}")]
    Processing(String),

    #[error("Insufficient audio data: need at least {0} samples")]
    InsufficientData(usize),
}

/// Trigger-phrase detector
pub trait WakeDetector: Send {
    fn name(&self) -> &str;

    /// Load models or open resources; called lazily before the first frame
    fn initialize(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }

    /// Whether the trigger phrase completed in this frame
    fn process(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError>;

    fn reset(&mut self) {}
}

/// Per-frame speech presence classifier
pub trait SpeechDetector: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }

    /// Whether this frame contains speech
    fn process(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError>;

    fn reset(&mut self) {}
}

/// Availability of a gated detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Not initialized yet (happens on the first frame)
    Uninitialized,
    Ready,
    /// Missing or failed to initialize; the gate answers with its fallback
    Unavailable,
}

/// Common surface of both detector kinds, used by `Gate`
trait Classifier {
    fn label(&self) -> &str;
    fn init(&mut self) -> Result<(), DetectorError>;
    fn classify(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError>;
    fn clear(&mut self);
}

impl Classifier for dyn WakeDetector {
    fn label(&self) -> &str {
        self.name()
    }
    fn init(&mut self) -> Result<(), DetectorError> {
        self.initialize()
    }
    fn classify(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError> {
        self.process(frame)
    }
    fn clear(&mut self) {
        self.reset()
    }
}

impl Classifier for dyn SpeechDetector {
    fn label(&self) -> &str {
        self.name()
    }
    fn init(&mut self) -> Result<(), DetectorError> {
        self.initialize()
    }
    fn classify(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError> {
        self.process(frame)
    }
    fn clear(&mut self) {
        self.reset()
    }
}

struct Gate<D: ?Sized + Classifier> {
    kind: &'static str,
    detector: Option<Box<D>>,
    status: GateStatus,
    fallback: bool,
    failures: u64,
}

impl<D: ?Sized + Classifier> Gate<D> {
    fn new(kind: &'static str, detector: Option<Box<D>>, fallback: bool) -> Self {
        let status = if detector.is_some() {
            GateStatus::Uninitialized
        } else {
            warn!("No {} detector configured, falling back to {}", kind, fallback);
            GateStatus::Unavailable
        };

        Self {
            kind,
            detector,
            status,
            fallback,
            failures: 0,
        }
    }

    fn ensure_ready(&mut self) -> bool {
        match self.status {
            GateStatus::Ready => true,
            GateStatus::Unavailable => false,
            GateStatus::Uninitialized => {
                let Some(detector) = self.detector.as_mut() else {
                    self.status = GateStatus::Unavailable;
                    return false;
                };

                match detector.init() {
                    Ok(()) => {
                        info!("{} detector '{}' initialized", self.kind, detector.label());
                        self.status = GateStatus::Ready;
                        true
                    }
                    Err(e) => {
                        self.failures += 1;
                        warn!(
                            "{} detector '{}' unavailable ({}), falling back to {}",
                            self.kind,
                            detector.label(),
                            e,
                            self.fallback
                        );
                        self.status = GateStatus::Unavailable;
                        false
                    }
                }
            }
        }
    }

    fn process(&mut self, frame: &AudioFrame<'_>) -> bool {
        if !self.ensure_ready() {
            return self.fallback;
        }

        let Some(detector) = self.detector.as_mut() else {
            return self.fallback;
        };

        match detector.classify(frame) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.failures += 1;
                // A bad frame is not a dead detector; only log occasionally
                if self.failures % 100 == 1 {
                    warn!(
                        "{} detector error on frame {}: {} ({} failures)",
                        self.kind,
                        frame.sequence(),
                        e,
                        self.failures
                    );
                }
                self.fallback
            }
        }
    }

    fn reinitialize(&mut self) -> GateStatus {
        if let Some(detector) = self.detector.as_mut() {
            detector.clear();
            self.status = GateStatus::Uninitialized;
            self.ensure_ready();
        }
        debug!("{} gate reinitialized: {:?}", self.kind, self.status);
        self.status
    }

    fn reset(&mut self) {
        if let Some(detector) = self.detector.as_mut() {
            detector.clear();
        }
    }
}

/// Wake detector wrapper that never triggers while the detector is missing
pub struct WakeGate(Gate<dyn WakeDetector>);

impl WakeGate {
    pub fn new(detector: Option<Box<dyn WakeDetector>>) -> Self {
        Self(Gate::new("wake", detector, false))
    }

    /// Initialize eagerly instead of on the first frame
    pub fn initialize(&mut self) -> GateStatus {
        self.0.ensure_ready();
        self.0.status
    }

    pub fn process(&mut self, frame: &AudioFrame<'_>) -> bool {
        self.0.process(frame)
    }

    /// Retry initialization of a detector that previously failed
    pub fn reinitialize(&mut self) -> GateStatus {
        self.0.reinitialize()
    }

    pub fn reset(&mut self) {
        self.0.reset()
    }

    pub fn status(&self) -> GateStatus {
        self.0.status
    }

    pub fn is_available(&self) -> bool {
        self.0.status != GateStatus::Unavailable
    }

    pub fn failures(&self) -> u64 {
        self.0.failures
    }
}

/// Speech detector wrapper that treats every frame as speech while the detector is missing
pub struct SpeechGate(Gate<dyn SpeechDetector>);

impl SpeechGate {
    pub fn new(detector: Option<Box<dyn SpeechDetector>>) -> Self {
        Self(Gate::new("speech", detector, true))
    }

    pub fn initialize(&mut self) -> GateStatus {
        self.0.ensure_ready();
        self.0.status
    }

    pub fn process(&mut self, frame: &AudioFrame<'_>) -> bool {
        self.0.process(frame)
    }

    pub fn reinitialize(&mut self) -> GateStatus {
        self.0.reinitialize()
    }

    pub fn reset(&mut self) {
        self.0.reset()
    }

    pub fn status(&self) -> GateStatus {
        self.0.status
    }

    pub fn is_available(&self) -> bool {
        self.0.status != GateStatus::Unavailable
    }

    pub fn failures(&self) -> u64 {
        self.0.failures
    }
}

/// Energy and zero-crossing speech classifier
///
/// Voiced speech has noticeable energy and a fairly low crossing rate;
/// hiss and clicks cross zero far more often.
pub struct EnergySpeechDetector {
    energy_threshold: f32,
    zcr_max: f32,
}

impl EnergySpeechDetector {
    pub fn new(energy_threshold: f32, zcr_max: f32) -> Self {
        Self {
            energy_threshold,
            zcr_max,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.speech_energy_threshold, config.speech_zcr_max)
    }
}

impl SpeechDetector for EnergySpeechDetector {
    fn name(&self) -> &str {
        "energy-speech"
    }

    fn process(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError> {
        if frame.len() < 2 {
            return Err(DetectorError::InsufficientData(2));
        }

        let energy = rms(frame.samples());
        let zcr = zero_crossing_rate(frame.samples());
        trace!("Frame analysis: energy={:.4}, zcr={:.4}", energy, zcr);

        Ok(energy > self.energy_threshold && zcr < self.zcr_max)
    }
}

/// Sustained energy-burst wake detector
///
/// Fires once `frames_required` consecutive frames exceed a threshold
/// derived from the sensitivity, then starts counting again.
pub struct EnergyWakeDetector {
    threshold: f32,
    frames_required: usize,
    consecutive: usize,
}

impl EnergyWakeDetector {
    pub fn new(sensitivity: f32, frames_required: usize) -> Self {
        Self {
            threshold: Self::threshold_for(sensitivity),
            frames_required: frames_required.max(1),
            consecutive: 0,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.wake_sensitivity, config.wake_frames_required)
    }

    /// RMS threshold for a sensitivity (higher sensitivity = lower threshold)
    pub fn threshold_for(sensitivity: f32) -> f32 {
        0.5 * (1.0 - sensitivity.clamp(0.0, 1.0)) + 0.02
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl WakeDetector for EnergyWakeDetector {
    fn name(&self) -> &str {
        "energy-wake"
    }

    fn process(&mut self, frame: &AudioFrame<'_>) -> Result<bool, DetectorError> {
        if frame.is_empty() {
            return Err(DetectorError::InsufficientData(1));
        }

        if rms(frame.samples()) > self.threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }

        if self.consecutive >= self.frames_required {
            self.consecutive = 0;
            trace!("Energy burst detected on frame {}", frame.sequence());
            return Ok(true);
        }
        Ok(false)
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Detector instances handed to the pipeline
///
/// The session gets its own speech detector so its hysteresis never shares
/// state with the engine's.
pub struct DetectorSet {
    pub wake: Option<Box<dyn WakeDetector>>,
    pub speech: Option<Box<dyn SpeechDetector>>,
    pub session_speech: Option<Box<dyn SpeechDetector>>,
}

impl DetectorSet {
    /// Reference energy detectors, honoring the enable flags
    pub fn energy(config: &DetectorConfig) -> Self {
        let speech = || -> Option<Box<dyn SpeechDetector>> {
            config
                .speech_enabled
                .then(|| Box::new(EnergySpeechDetector::from_config(config)) as Box<dyn SpeechDetector>)
        };

        Self {
            wake: config
                .wake_enabled
                .then(|| Box::new(EnergyWakeDetector::from_config(config)) as Box<dyn WakeDetector>),
            speech: speech(),
            session_speech: speech(),
        }
    }

    /// No detectors at all: wake never fires, every frame is speech
    pub fn none() -> Self {
        Self {
            wake: None,
            speech: None,
            session_speech: None,
        }
    }
}
