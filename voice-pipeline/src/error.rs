/// Crate-wide error taxonomy
///
/// Only `Device` is fatal (the engine parks in `Error` until reinitialized).
/// Everything else degrades or recovers on its own.

use crate::config::ConfigError;
use crate::detector::DetectorError;
use crate::engine::EngineState;
use crate::inference::InferenceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(#[from] DetectorError),

    #[error("Session buffer full at {0} frames")]
    BufferOverflow(usize),

    #[error("Recording too short: {frames} frames (minimum {minimum})")]
    RecordingTooShort { frames: usize, minimum: usize },

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Whether recovery needs an explicit reinitialize
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}
