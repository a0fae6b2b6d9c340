/// Notifications published to external observers
///
/// Events are produced on the realtime thread or the control side, carried
/// across by the event bridge and handed to every registered sink.

use crate::engine::EngineState;
use crate::session::{CommandResult, SessionState};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// Trigger phrase recognized while idle
    WakeDetected { timestamp_us: i64, frame: u64 },

    EngineStateChanged {
        from: EngineState,
        to: EngineState,
        timestamp_us: i64,
    },

    SessionStateChanged {
        from: SessionState,
        to: SessionState,
        message: Option<String>,
        timestamp_us: i64,
    },

    /// Successful interaction outcome
    CommandResult(CommandResult),

    /// Audio backend reported a stream error
    DeviceFault { message: String, timestamp_us: i64 },
}

impl VoiceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WakeDetected { .. } => "wake_detected",
            Self::EngineStateChanged { .. } => "engine_state_changed",
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::CommandResult(_) => "command_result",
            Self::DeviceFault { .. } => "device_fault",
        }
    }
}

/// Fire-and-forget destination for events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &VoiceEvent);
}

/// Fans events out to any number of async subscribers
pub struct BroadcastSink {
    tx: broadcast::Sender<VoiceEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &VoiceEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
    }
}

/// Writes each event as a JSON line through tracing
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &VoiceEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "voice_pipeline::events", "{}", json),
            Err(e) => warn!("Failed to serialize {} event: {}", event.kind(), e),
        }
    }
}

/// Current timestamp in microseconds since the Unix epoch
pub fn timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = VoiceEvent::EngineStateChanged {
            from: EngineState::Idle,
            to: EngineState::Listening,
            timestamp_us: 42,
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "engine_state_changed");
        assert_eq!(json["from"], "idle");
        assert_eq!(json["to"], "listening");
        assert_eq!(json["timestamp_us"], 42);
    }

    #[test]
    fn test_command_result_serialization() {
        let event = VoiceEvent::CommandResult(CommandResult {
            kind: "native_audio_response".to_string(),
            status: "success".to_string(),
            recorded_frames: 40,
            response_samples: 24000,
            sample_rate: 24000,
            text: Some("turning the lights on".to_string()),
        });

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "command_result");
        assert_eq!(json["kind"], "native_audio_response");
        assert_eq!(json["status"], "success");
        assert_eq!(json["recorded_frames"], 40);

        let state = VoiceEvent::SessionStateChanged {
            from: SessionState::Processing,
            to: SessionState::Error,
            message: Some("Inference returned no audio".to_string()),
            timestamp_us: 7,
        };
        let json: serde_json::Value = serde_json::to_value(&state).unwrap();
        assert_eq!(json["to"], "error");
    }

    #[test]
    fn test_wake_event_kind() {
        let event = VoiceEvent::WakeDetected {
            timestamp_us: timestamp_micros(),
            frame: 10,
        };
        assert_eq!(event.kind(), "wake_detected");
        assert!(timestamp_micros() > 0);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        sink.publish(&VoiceEvent::DeviceFault {
            message: "unplugged".to_string(),
            timestamp_us: 1,
        });

        match rx.recv().await.unwrap() {
            VoiceEvent::DeviceFault { message, .. } => assert_eq!(message, "unplugged"),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::new(4);
        sink.publish(&VoiceEvent::WakeDetected {
            timestamp_us: 0,
            frame: 0,
        });
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[test]
    fn test_mock_sink() {
        let mut sink = MockEventSink::new();
        sink.expect_publish()
            .withf(|event| event.kind() == "wake_detected")
            .times(1)
            .return_const(());

        sink.publish(&VoiceEvent::WakeDetected {
            timestamp_us: 0,
            frame: 3,
        });
    }
}
