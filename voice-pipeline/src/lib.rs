/// Real-time voice command pipeline
///
/// Captures audio frames on a realtime thread, gates them through a wake-word
/// and speech detector, records the utterance, hands it to an inference
/// backend and plays the response. State changes reach observers through a
/// non-blocking event bridge.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod detector;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod history;
pub mod inference;
pub mod pipeline;
pub mod replay;
pub mod session;
pub mod vad;
pub mod wav;

// Re-export main types
pub use bridge::{BridgeStats, EventBridge};
pub use bus::{BusStats, FrameBus, FrameListener, ListenerError};
pub use config::{ConfigError, DetectorConfig, DeviceConfig, EngineConfig, PipelineConfig, SessionConfig};
pub use detector::{
    DetectorError, DetectorSet, EnergySpeechDetector, EnergyWakeDetector, GateStatus, SpeechDetector,
    SpeechGate, WakeDetector, WakeGate,
};
pub use device::{AudioIo, CpalAudioIo, DeviceInfo, FaultCallback, FrameCallback};
pub use engine::{EngineState, EngineStats, Handoff, VoiceEngine};
pub use error::{PipelineError, Result};
pub use events::{BroadcastSink, EventSink, LogSink, VoiceEvent};
pub use frame::{AudioFrame, AudioSample, FRAME_LENGTH, SAMPLE_RATE};
pub use history::AudioHistory;
pub use inference::{InferenceBackend, InferenceError, InferenceOutput, InferenceWorker, LoopbackBackend};
pub use pipeline::{PipelineStatus, VoicePipeline};
pub use replay::ReplayAudioIo;
pub use session::{
    CommandResult, CommandSession, InteractionObserver, InteractionOutcome, ResultCallback,
    SessionState, SessionStatus, StopOutcome,
};
pub use vad::{HysteresisState, HysteresisTracker, SpeechTransition};
