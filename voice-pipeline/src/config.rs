/// Pipeline configuration
///
/// Everything is injected at construction and immutable afterwards; a
/// change means stop, build a new pipeline from the new config, start.
/// Values come from an optional JSON file and are then overridden by
/// environment variables.

use crate::frame::{frames_for_millis, FRAME_LENGTH, SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on a single recording; the session buffer is preallocated
/// to this size at the start of every interaction
pub const MAX_RECORDING_SECS: f64 = 600.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Audio device selection and stream shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Index into the host device list for capture (None = system default)
    pub input_device: Option<usize>,

    /// Index into the host device list for playback (None = system default)
    pub output_device: Option<usize>,

    /// Capture sample rate
    pub sample_rate: u32,

    /// Samples per frame delivered to listeners
    pub frame_length: usize,

    /// Preferred playback rate (inference output is resampled to the open stream's rate)
    pub output_sample_rate: u32,

    /// Seconds of rolling input history kept by the device
    pub history_secs: u32,

    /// Seconds of audio the playback queue can hold
    pub playback_buffer_secs: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: SAMPLE_RATE,
            frame_length: FRAME_LENGTH,
            output_sample_rate: 24000,
            history_secs: 30,
            playback_buffer_secs: 120,
        }
    }
}

/// Detector sensitivities and hysteresis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Wake sensitivity (0.0 - 1.0, higher = more sensitive, more false positives)
    pub wake_sensitivity: f32,

    /// Consecutive trigger frames the energy wake detector needs
    pub wake_frames_required: usize,

    /// RMS energy above which a frame may be speech
    pub speech_energy_threshold: f32,

    /// Zero-crossing rate above which a frame is treated as noise
    pub speech_zcr_max: f32,

    /// Silence that must elapse after speech before it counts as ended
    pub min_silence_duration_ms: u32,

    /// Disable to run without a wake detector (never triggers)
    pub wake_enabled: bool,

    /// Disable to run without a speech detector (every frame is speech)
    pub speech_enabled: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            wake_sensitivity: 0.7,
            wake_frames_required: 3,
            speech_energy_threshold: 0.02,
            speech_zcr_max: 0.35,
            min_silence_duration_ms: 500,
            wake_enabled: true,
            speech_enabled: true,
        }
    }
}

/// Engine state machine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Same-state transitions inside this window are suppressed
    pub debounce_cooldown_ms: u64,

    /// Listening without speech for this long returns to idle
    pub listen_timeout_ms: u64,

    /// Capacity of the realtime-to-async event queue
    pub event_queue_capacity: usize,

    /// Capacity of the engine-to-session handoff queue
    pub handoff_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_cooldown_ms: 1000,
            listen_timeout_ms: 8000,
            event_queue_capacity: 256,
            handoff_capacity: 8,
        }
    }
}

/// Per-interaction recording and response handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard cap on recorded frames (3000 frames is ~96s at 16kHz/512)
    pub max_buffer_frames: usize,

    /// Recordings shorter than this are dropped without inference
    pub min_recording_ms: u64,

    /// Delay before Success/Error falls back to Idle
    pub reset_delay_ms: u64,

    /// Gain applied after peak normalization of the response
    pub makeup_gain: f32,

    /// Play a short tone when recording starts
    pub confirmation_tone: bool,

    /// Stop recording on sustained silence instead of waiting for an explicit stop
    pub auto_stop_on_silence: bool,

    /// Inference requests allowed to be queued or running at once
    pub inference_queue_depth: usize,

    /// Audio before the detected speech onset copied into a wake-triggered recording
    pub preroll_ms: u64,

    /// Write every dispatched recording here as WAV
    pub save_recordings_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffer_frames: 3000,
            min_recording_ms: 500,
            reset_delay_ms: 2000,
            makeup_gain: 2.0,
            confirmation_tone: true,
            auto_stop_on_silence: false,
            inference_queue_depth: 2,
            preroll_ms: 300,
            save_recordings_dir: None,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub device: DeviceConfig,
    pub detector: DetectorConfig,
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

impl PipelineConfig {
    /// Parse a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&raw)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `VOICE_CONFIG` (if set), then apply environment overrides and validate
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("VOICE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;

        info!(
            sample_rate = config.device.sample_rate,
            frame_length = config.device.frame_length,
            max_buffer_frames = config.session.max_buffer_frames,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VOICE_INPUT_DEVICE") {
            self.device.input_device = Some(parse_env("VOICE_INPUT_DEVICE", &v)?);
        }
        if let Some(v) = lookup("VOICE_OUTPUT_DEVICE") {
            self.device.output_device = Some(parse_env("VOICE_OUTPUT_DEVICE", &v)?);
        }
        if let Some(v) = lookup("VOICE_SAMPLE_RATE") {
            self.device.sample_rate = parse_env("VOICE_SAMPLE_RATE", &v)?;
        }
        if let Some(v) = lookup("VOICE_FRAME_LENGTH") {
            self.device.frame_length = parse_env("VOICE_FRAME_LENGTH", &v)?;
        }
        if let Some(v) = lookup("WAKEWORD_SENSITIVITY") {
            self.detector.wake_sensitivity = parse_env("WAKEWORD_SENSITIVITY", &v)?;
        }
        if let Some(v) = lookup("VOICE_MAX_BUFFER_FRAMES") {
            self.session.max_buffer_frames = parse_env("VOICE_MAX_BUFFER_FRAMES", &v)?;
        }
        if let Some(v) = lookup("VOICE_MIN_SILENCE_MS") {
            self.detector.min_silence_duration_ms = parse_env("VOICE_MIN_SILENCE_MS", &v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = &self.device;
        if device.sample_rate == 0 || device.output_sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "sample rates must be greater than 0".to_string(),
            ));
        }

        if device.frame_length == 0 || device.frame_length > 8192 {
            return Err(ConfigError::Invalid(format!(
                "frame_length must be between 1 and 8192, got {}",
                device.frame_length
            )));
        }

        let detector = &self.detector;
        if !(0.0..=1.0).contains(&detector.wake_sensitivity) {
            return Err(ConfigError::Invalid(
                "wake_sensitivity must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&detector.speech_energy_threshold) {
            return Err(ConfigError::Invalid(
                "speech_energy_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if detector.wake_frames_required == 0 {
            return Err(ConfigError::Invalid(
                "wake_frames_required must be greater than 0".to_string(),
            ));
        }

        if self.engine.event_queue_capacity == 0 || self.engine.handoff_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be greater than 0".to_string(),
            ));
        }

        let session = &self.session;
        if session.max_buffer_frames == 0 {
            return Err(ConfigError::Invalid(
                "max_buffer_frames must be greater than 0".to_string(),
            ));
        }

        if self.max_recording_secs() > MAX_RECORDING_SECS {
            return Err(ConfigError::Invalid(format!(
                "max_buffer_frames ({}) allows {:.0}s of audio, the limit is {:.0}s",
                session.max_buffer_frames,
                self.max_recording_secs(),
                MAX_RECORDING_SECS
            )));
        }

        if self.preroll_frames() > session.max_buffer_frames {
            return Err(ConfigError::Invalid(format!(
                "preroll_ms ({}) exceeds the buffer capacity of {} frames",
                session.preroll_ms, session.max_buffer_frames
            )));
        }

        if self.min_recording_frames() > session.max_buffer_frames {
            return Err(ConfigError::Invalid(format!(
                "min_recording_ms ({}) exceeds the buffer capacity of {} frames",
                session.min_recording_ms, session.max_buffer_frames
            )));
        }

        if session.inference_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "inference_queue_depth must be at least 1".to_string(),
            ));
        }

        if !session.makeup_gain.is_finite() || session.makeup_gain <= 0.0 {
            return Err(ConfigError::Invalid(
                "makeup_gain must be a positive number".to_string(),
            ));
        }

        Ok(())
    }

    /// Minimum number of frames a recording needs to be dispatched
    pub fn min_recording_frames(&self) -> usize {
        frames_for_millis(
            self.session.min_recording_ms,
            self.device.sample_rate,
            self.device.frame_length,
        ) as usize
    }

    /// Frames of pre-roll kept ahead of a wake-triggered recording
    pub fn preroll_frames(&self) -> usize {
        frames_for_millis(
            self.session.preroll_ms,
            self.device.sample_rate,
            self.device.frame_length,
        ) as usize
    }

    /// Longest possible recording, determined by the frame cap
    pub fn max_recording_secs(&self) -> f64 {
        self.session.max_buffer_frames as f64 * self.device.frame_length as f64
            / f64::from(self.device.sample_rate)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}
