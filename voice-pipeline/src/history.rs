/// Rolling input history
///
/// Ring buffer holding the most recent seconds of captured audio. The
/// realtime callback writes with `try_lock` only: if the control side is
/// holding a half of the buffer, the write is dropped rather than waiting.

use cache_padded::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::frame::AudioSample;

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Ring buffer for captured samples
/// Uses separate producer and consumer so each side locks only its half
pub struct AudioHistory {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
    sample_rate: u32,
    dropped_writes: CachePadded<AtomicU64>,
}

impl AudioHistory {
    /// Create a history holding `secs` seconds at `sample_rate`
    pub fn new(secs: u32, sample_rate: u32) -> Self {
        Self::with_capacity((secs as usize * sample_rate as usize).max(1), sample_rate)
    }

    pub fn with_capacity(capacity: usize, sample_rate: u32) -> Self {
        debug!("Creating audio history with capacity: {} samples", capacity);

        let rb = RingBuffer::new(capacity.max(1));
        let (producer, consumer) = rb.split();

        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
            sample_rate,
            dropped_writes: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Append samples without blocking (realtime side)
    ///
    /// When the ring is full the oldest samples are discarded. Returns the
    /// number of samples written; 0 if the producer half was busy.
    pub fn push(&self, samples: &[AudioSample]) -> usize {
        let Some(mut producer) = self.producer.try_lock() else {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            return 0;
        };

        let vacant = producer.vacant_len();
        if samples.len() > vacant {
            // Make room by dropping the oldest samples, if the reader lets us
            if let Some(mut consumer) = self.consumer.try_lock() {
                consumer.skip(samples.len() - vacant);
            }
        }

        // Only the newest samples fit when a single write exceeds capacity
        let capacity = producer.capacity().get();
        let tail = &samples[samples.len().saturating_sub(capacity)..];
        producer.push_slice(tail)
    }

    /// Read samples without removing them
    pub fn peek(&self, count: usize) -> Vec<AudioSample> {
        let consumer = self.consumer.lock();
        consumer.iter().take(count).copied().collect()
    }

    /// Newest `count` samples, oldest first, without removing them
    ///
    /// Returns None instead of waiting if the reader half is held elsewhere.
    pub fn try_peek_newest(&self, count: usize) -> Option<Vec<AudioSample>> {
        let consumer = self.consumer.try_lock()?;
        let skip = consumer.occupied_len().saturating_sub(count);
        Some(consumer.iter().skip(skip).copied().collect())
    }

    /// Remove and return everything currently buffered
    pub fn take(&self) -> Vec<AudioSample> {
        let mut consumer = self.consumer.lock();
        let mut out = vec![0.0; consumer.occupied_len()];
        let read = consumer.pop_slice(&mut out);
        out.truncate(read);
        out
    }

    /// Clear all data from the buffer
    pub fn clear(&self) {
        let mut consumer = self.consumer.lock();
        let occupied = consumer.occupied_len();
        consumer.skip(occupied);
        debug!("Cleared audio history ({} samples)", occupied);
    }

    pub fn len(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.lock().capacity().get()
    }

    /// Writes dropped because the producer half was contended
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    /// Duration of audio currently buffered (in seconds)
    pub fn duration_secs(&self) -> f32 {
        self.len() as f32 / self.sample_rate as f32
    }
}
