/// Frame fan-out
///
/// One frame stream, many listeners. Listeners run in registration order on
/// the realtime thread. Each call is isolated: an error or a panic in one
/// listener is counted and logged, and delivery continues with the next.
///
/// Registration publishes a new immutable listener list and bumps a
/// generation counter. The dispatcher keeps its own snapshot and swaps it
/// with a `try_lock` when the generation moves, so a frame never waits on a
/// registering thread.
///
/// A bus built with a pre-roll keeps the last few frames in a small rolling
/// history, so a listener that joins late can recover audio it missed.

use crate::device::FrameCallback;
use crate::frame::{AudioFrame, AudioSample};
use crate::history::AudioHistory;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, trace, warn};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Listener busy, frame skipped")]
    Busy,

    #[error("Listener failed: {0}")]
    Failed(String),
}

/// Consumer of the realtime frame stream
pub trait FrameListener: Send + Sync {
    fn name(&self) -> &str;

    /// Called on the realtime thread; must not block
    fn on_frame(&self, frame: &AudioFrame<'_>) -> Result<(), ListenerError>;
}

type ListenerList = Arc<Vec<Arc<dyn FrameListener>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub listeners: usize,
    pub frames_dispatched: u64,
    pub listener_errors: u64,
    pub listener_panics: u64,
    pub frames_skipped: u64,
}

pub struct FrameBus {
    listeners: Mutex<ListenerList>,
    generation: AtomicU64,
    frames: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
    skipped: AtomicU64,
    recent: Option<Preroll>,
}

/// Rolling copy of the newest frames, written before listeners run
struct Preroll {
    history: AudioHistory,
    frames: usize,
    frame_length: usize,
}

impl FrameBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Arc::new(Vec::new())),
            generation: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            recent: None,
        }
    }

    /// Bus that also remembers the `frames` frames before the current one
    pub fn with_preroll(frames: usize, frame_length: usize, sample_rate: u32) -> Self {
        let mut bus = Self::new();
        if frames > 0 && frame_length > 0 {
            // One extra frame: the frame being dispatched is already in the history
            bus.recent = Some(Preroll {
                history: AudioHistory::with_capacity((frames + 1) * frame_length, sample_rate),
                frames,
                frame_length,
            });
        }
        bus
    }

    /// Up to `frames` whole frames delivered before the current one, oldest first
    ///
    /// Only meaningful from inside `FrameListener::on_frame`. Never blocks; an
    /// empty result means there is no pre-roll or it was busy.
    pub fn preroll(&self, frames: usize) -> Vec<AudioSample> {
        let Some(recent) = &self.recent else {
            return Vec::new();
        };
        if frames == 0 {
            return Vec::new();
        }

        let wanted = (frames.min(recent.frames) + 1) * recent.frame_length;
        let Some(mut samples) = recent.history.try_peek_newest(wanted) else {
            return Vec::new();
        };

        // Drop any partial frame at the front, then the current frame at the back
        let partial = samples.len() % recent.frame_length;
        samples.drain(..partial);
        samples.truncate(samples.len().saturating_sub(recent.frame_length));
        samples
    }

    /// Add a listener at the end of the delivery order
    pub fn register(&self, listener: Arc<dyn FrameListener>) {
        let mut listeners = self.listeners.lock();
        let mut next: Vec<_> = listeners.iter().cloned().collect();
        info!("Registering frame listener '{}' (#{})", listener.name(), next.len() + 1);
        next.push(listener);
        *listeners = Arc::new(next);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Create the per-stream dispatcher that runs on the realtime thread
    pub fn dispatcher(self: &Arc<Self>) -> FrameDispatcher {
        let snapshot = self.listeners.lock().clone();
        FrameDispatcher {
            bus: Arc::clone(self),
            generation: self.generation.load(Ordering::Acquire),
            snapshot,
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            listeners: self.listener_count(),
            frames_dispatched: self.frames.load(Ordering::Relaxed),
            listener_errors: self.errors.load(Ordering::Relaxed),
            listener_panics: self.panics.load(Ordering::Relaxed),
            frames_skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivers frames to the bus's listeners
pub struct FrameDispatcher {
    bus: Arc<FrameBus>,
    generation: u64,
    snapshot: ListenerList,
}

impl FrameDispatcher {
    pub fn dispatch(&mut self, frame: &AudioFrame<'_>) {
        self.refresh();

        let bus = &self.bus;
        bus.frames.fetch_add(1, Ordering::Relaxed);
        if let Some(recent) = &bus.recent {
            recent.history.push(frame.samples());
        }

        for listener in self.snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_frame(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(ListenerError::Busy)) => {
                    bus.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    let errors = bus.errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors == 1 || errors % 100 == 0 {
                        warn!(
                            "Listener '{}' failed on frame {}: {} ({} errors)",
                            listener.name(),
                            frame.sequence(),
                            e,
                            errors
                        );
                    }
                }
                Err(_) => {
                    let panics = bus.panics.fetch_add(1, Ordering::Relaxed) + 1;
                    if panics == 1 || panics % 100 == 0 {
                        warn!(
                            "Listener '{}' panicked on frame {} ({} panics)",
                            listener.name(),
                            frame.sequence(),
                            panics
                        );
                    }
                }
            }
        }
    }

    /// Pick up listeners registered since the last frame, if the list is free
    fn refresh(&mut self) {
        let current = self.bus.generation.load(Ordering::Acquire);
        if current == self.generation {
            return;
        }

        if let Some(listeners) = self.bus.listeners.try_lock() {
            self.snapshot = Arc::clone(&listeners);
            self.generation = current;
            trace!("Dispatcher picked up {} listeners", self.snapshot.len());
        }
    }

    /// Wrap into the callback handed to the audio device
    pub fn into_callback(mut self) -> FrameCallback {
        Box::new(move |frame: &AudioFrame<'_>| self.dispatch(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        name: String,
        seen: AtomicUsize,
    }

    impl Counting {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: AtomicUsize::new(0),
            })
        }
    }

    impl FrameListener for Counting {
        fn name(&self) -> &str {
            &self.name
        }
        fn on_frame(&self, _frame: &AudioFrame<'_>) -> Result<(), ListenerError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panicking;

    impl FrameListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }
        fn on_frame(&self, _frame: &AudioFrame<'_>) -> Result<(), ListenerError> {
            panic!("listener bug");
        }
    }

    struct Failing;

    impl FrameListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn on_frame(&self, _frame: &AudioFrame<'_>) -> Result<(), ListenerError> {
            Err(ListenerError::Failed("bad frame".to_string()))
        }
    }

    fn frame(samples: &[f32], seq: u64) -> AudioFrame<'_> {
        AudioFrame::new(samples, 16000, seq)
    }

    #[test]
    fn test_dispatch_to_all_listeners() {
        let bus = Arc::new(FrameBus::new());
        let a = Counting::new("a");
        let b = Counting::new("b");
        bus.register(a.clone());
        bus.register(b.clone());

        let mut dispatcher = bus.dispatcher();
        let samples = vec![0.0; 512];
        for i in 0..10 {
            dispatcher.dispatch(&frame(&samples, i));
        }

        assert_eq!(a.seen.load(Ordering::SeqCst), 10);
        assert_eq!(b.seen.load(Ordering::SeqCst), 10);
        assert_eq!(bus.stats().frames_dispatched, 10);
    }

    #[test]
    fn test_panicking_listener_isolated() {
        let bus = Arc::new(FrameBus::new());
        let after = Counting::new("after");
        bus.register(Arc::new(Panicking));
        bus.register(Arc::new(Failing));
        bus.register(after.clone());

        let mut dispatcher = bus.dispatcher();
        let samples = vec![0.0; 512];
        for i in 0..3 {
            dispatcher.dispatch(&frame(&samples, i));
        }

        assert_eq!(after.seen.load(Ordering::SeqCst), 3);
        let stats = bus.stats();
        assert_eq!(stats.listener_panics, 3);
        assert_eq!(stats.listener_errors, 3);
    }

    #[test]
    fn test_late_registration_picked_up() {
        let bus = Arc::new(FrameBus::new());
        let early = Counting::new("early");
        bus.register(early.clone());

        let mut dispatcher = bus.dispatcher();
        let samples = vec![0.0; 512];
        dispatcher.dispatch(&frame(&samples, 0));

        let late = Counting::new("late");
        bus.register(late.clone());
        dispatcher.dispatch(&frame(&samples, 1));

        assert_eq!(early.seen.load(Ordering::SeqCst), 2);
        assert_eq!(late.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_deferred_while_list_locked() {
        let bus = Arc::new(FrameBus::new());
        let mut dispatcher = bus.dispatcher();

        let late = Counting::new("late");
        bus.register(late.clone());

        let samples = vec![0.0; 512];
        {
            let _held = bus.listeners.lock();
            // Old snapshot is used instead of waiting
            dispatcher.dispatch(&frame(&samples, 0));
        }
        assert_eq!(late.seen.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(&frame(&samples, 1));
        assert_eq!(late.seen.load(Ordering::SeqCst), 1);
    }

    /// Reads the pre-roll while handling a frame
    struct Lookback {
        bus: std::sync::Weak<FrameBus>,
        wanted: usize,
        seen: Mutex<Vec<f32>>,
    }

    impl FrameListener for Lookback {
        fn name(&self) -> &str {
            "lookback"
        }
        fn on_frame(&self, _frame: &AudioFrame<'_>) -> Result<(), ListenerError> {
            if let Some(bus) = self.bus.upgrade() {
                *self.seen.lock() = bus.preroll(self.wanted);
            }
            Ok(())
        }
    }

    #[test]
    fn test_preroll_returns_frames_before_current() {
        let bus = Arc::new(FrameBus::with_preroll(3, 4, 16000));
        let recent = Arc::new(Lookback {
            bus: Arc::downgrade(&bus),
            wanted: 2,
            seen: Mutex::new(Vec::new()),
        });
        let capped = Arc::new(Lookback {
            bus: Arc::downgrade(&bus),
            wanted: 10,
            seen: Mutex::new(Vec::new()),
        });
        bus.register(recent.clone());
        bus.register(capped.clone());

        let mut dispatcher = bus.dispatcher();
        for i in 0..6u64 {
            let samples = vec![i as f32; 4];
            dispatcher.dispatch(&frame(&samples, i));
        }

        assert_eq!(*recent.seen.lock(), vec![3.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0, 4.0]);
        // Never more than the configured three frames
        let capped = capped.seen.lock();
        assert_eq!(capped.len(), 12);
        assert_eq!(capped[0], 2.0);
        assert_eq!(capped[11], 4.0);
    }

    #[test]
    fn test_no_preroll_by_default() {
        let bus = Arc::new(FrameBus::new());
        let listener = Arc::new(Lookback {
            bus: Arc::downgrade(&bus),
            wanted: 2,
            seen: Mutex::new(vec![1.0]),
        });
        bus.register(listener.clone());

        let mut dispatcher = bus.dispatcher();
        let samples = vec![0.5; 4];
        dispatcher.dispatch(&frame(&samples, 0));
        dispatcher.dispatch(&frame(&samples, 1));

        assert!(listener.seen.lock().is_empty());
    }

    #[test]
    fn test_into_callback() {
        let bus = Arc::new(FrameBus::new());
        let listener = Counting::new("cb");
        bus.register(listener.clone());

        let mut callback = bus.dispatcher().into_callback();
        let samples = vec![0.0; 512];
        callback(&frame(&samples, 0));

        assert_eq!(listener.seen.load(Ordering::SeqCst), 1);
    }
}
