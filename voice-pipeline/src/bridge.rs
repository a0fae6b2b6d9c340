/// Realtime-to-async event bridge
///
/// `publish` is called from the audio callback and must never wait. Events
/// go into a bounded tokio channel drained by a task on the runtime captured
/// at `attach`. With no consumer attached, or with the queue full, the event
/// is dropped and counted.

use crate::events::{EventSink, VoiceEvent};
use cache_padded::CachePadded;
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Bridge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub published: u64,
    pub dropped_no_consumer: u64,
    pub dropped_full: u64,
}

impl BridgeStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_no_consumer + self.dropped_full
    }
}

pub struct EventBridge {
    capacity: usize,
    sender: RwLock<Option<mpsc::Sender<VoiceEvent>>>,
    published: CachePadded<AtomicU64>,
    dropped_no_consumer: CachePadded<AtomicU64>,
    dropped_full: CachePadded<AtomicU64>,
}

impl EventBridge {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sender: RwLock::new(None),
            published: CachePadded::new(AtomicU64::new(0)),
            dropped_no_consumer: CachePadded::new(AtomicU64::new(0)),
            dropped_full: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Start delivering events to `sinks` on the given runtime
    ///
    /// Replaces any previous consumer. The drain task ends after `detach`
    /// once the queued events have been delivered.
    pub fn attach(&self, handle: &Handle, sinks: Vec<Arc<dyn EventSink>>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<VoiceEvent>(self.capacity);
        *self.sender.write() = Some(tx);

        info!(
            "Event bridge attached ({} sinks, capacity {})",
            sinks.len(),
            self.capacity
        );

        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if catch_unwind(AssertUnwindSafe(|| sink.publish(&event))).is_err() {
                        warn!("Event sink panicked on {} event", event.kind());
                    }
                }
            }
            debug!("Event bridge drain task finished");
        })
    }

    /// Disconnect the consumer; later events are dropped
    pub fn detach(&self) {
        if self.sender.write().take().is_some() {
            info!("Event bridge detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Hand an event to the async side without blocking
    ///
    /// Returns whether the event was queued.
    pub fn publish(&self, event: VoiceEvent) -> bool {
        // A writer only holds the lock while attaching or detaching
        let Some(guard) = self.sender.try_read() else {
            self.count_drop(&self.dropped_no_consumer, &event, "consumer changing");
            return false;
        };

        let Some(tx) = guard.as_ref() else {
            self.count_drop(&self.dropped_no_consumer, &event, "no consumer");
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                self.count_drop(&self.dropped_full, &event, "queue full");
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.count_drop(&self.dropped_no_consumer, &event, "consumer gone");
                false
            }
        }
    }

    fn count_drop(&self, counter: &AtomicU64, event: &VoiceEvent, reason: &str) {
        let dropped = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 100 == 0 {
            trace!("Dropped {} event: {} ({} so far)", event.kind(), reason, dropped);
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_no_consumer: self.dropped_no_consumer.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
        }
    }
}
