/// Inference backend seam and bounded worker
///
/// The backend turns a recorded utterance into response audio. The worker
/// admits at most `queue_depth` requests (queued plus running) and runs one
/// at a time; anything beyond the depth is rejected immediately.

use crate::frame::AudioSample;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Inference backend not ready: {0}")]
    NotReady(String),

    #[error("Inference failed: {0}")]
    Failed(String),

    #[error("Inference returned no audio")]
    EmptyResult,

    #[error("Inference queue full ({0} requests pending)")]
    Busy(usize),

    #[error("Invalid inference input: {0}")]
    InvalidInput(String),
}

/// Response produced by a backend
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub samples: Vec<AudioSample>,
    pub sample_rate: u32,
    /// Transcript or reply text, if the backend produces one
    pub text: Option<String>,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Load models ahead of the first request
    async fn warm_up(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn infer(
        &self,
        samples: Vec<AudioSample>,
        sample_rate: u32,
    ) -> Result<InferenceOutput, InferenceError>;
}

pub type InferenceHandle = JoinHandle<Result<InferenceOutput, InferenceError>>;

pub struct InferenceWorker {
    backend: Arc<dyn InferenceBackend>,
    permits: Arc<Semaphore>,
    depth: usize,
    exclusive: Arc<Mutex<()>>,
    submitted: AtomicU64,
    rejected: AtomicU64,
}

impl InferenceWorker {
    pub fn new(backend: Arc<dyn InferenceBackend>, queue_depth: usize) -> Self {
        let depth = queue_depth.max(1);
        Self {
            backend,
            permits: Arc::new(Semaphore::new(depth)),
            depth,
            exclusive: Arc::new(Mutex::new(())),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Warm the backend up in the background
    ///
    /// Requests submitted meanwhile wait for warm-up to finish.
    pub fn spawn_warm_up(&self, handle: &Handle) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let exclusive = Arc::clone(&self.exclusive);

        handle.spawn(async move {
            let _guard = exclusive.lock().await;
            let started = Instant::now();
            match backend.warm_up().await {
                Ok(()) => info!(
                    "Inference backend '{}' warmed up in {:?}",
                    backend.name(),
                    started.elapsed()
                ),
                Err(e) => warn!("Inference warm-up failed for '{}': {}", backend.name(), e),
            }
        })
    }

    /// Queue an utterance for inference
    ///
    /// Returns at once; the handle resolves when the backend finishes.
    pub fn submit(
        &self,
        handle: &Handle,
        samples: Vec<AudioSample>,
        sample_rate: u32,
    ) -> Result<InferenceHandle, InferenceError> {
        if samples.is_empty() {
            return Err(InferenceError::InvalidInput("no samples".to_string()));
        }

        let permit = Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Inference queue full, rejecting request");
            InferenceError::Busy(self.depth)
        })?;

        let request = self.submitted.fetch_add(1, Ordering::Relaxed) + 1;
        let backend = Arc::clone(&self.backend);
        let exclusive = Arc::clone(&self.exclusive);

        debug!(
            "Submitting inference request #{} ({} samples @ {} Hz)",
            request,
            samples.len(),
            sample_rate
        );

        Ok(handle.spawn(async move {
            let _permit = permit;
            let _guard = exclusive.lock().await;

            let started = Instant::now();
            let output = backend.infer(samples, sample_rate).await?;
            if output.samples.is_empty() {
                return Err(InferenceError::EmptyResult);
            }

            debug!(
                "Inference request #{} produced {} samples in {:?}",
                request,
                output.samples.len(),
                started.elapsed()
            );
            Ok(output)
        }))
    }

    /// Requests queued or running
    pub fn in_flight(&self) -> usize {
        self.depth - self.permits.available_permits()
    }

    pub fn queue_depth(&self) -> usize {
        self.depth
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Echoes the recording back, optionally after a delay
pub struct LoopbackBackend {
    delay: Duration,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn infer(
        &self,
        samples: Vec<AudioSample>,
        sample_rate: u32,
    ) -> Result<InferenceOutput, InferenceError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let seconds = samples.len() as f32 / sample_rate.max(1) as f32;
        Ok(InferenceOutput {
            samples,
            sample_rate,
            text: Some(format!("echo of {:.1}s of audio", seconds)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Tracks how many calls run at once
    struct Concurrency {
        running: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for Concurrency {
        fn name(&self) -> &str {
            "concurrency"
        }

        async fn infer(
            &self,
            samples: Vec<AudioSample>,
            sample_rate: u32,
        ) -> Result<InferenceOutput, InferenceError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(InferenceOutput {
                samples,
                sample_rate,
                text: None,
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl InferenceBackend for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn infer(
            &self,
            _samples: Vec<AudioSample>,
            sample_rate: u32,
        ) -> Result<InferenceOutput, InferenceError> {
            Ok(InferenceOutput {
                samples: Vec::new(),
                sample_rate,
                text: None,
            })
        }
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let worker = InferenceWorker::new(Arc::new(LoopbackBackend::new()), 2);
        let handle = worker
            .submit(&Handle::current(), vec![0.1; 16000], 16000)
            .unwrap();

        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.samples.len(), 16000);
        assert_eq!(output.sample_rate, 16000);
        assert_eq!(output.text.as_deref(), Some("echo of 1.0s of audio"));
    }

    #[tokio::test]
    async fn test_empty_result_is_error() {
        let worker = InferenceWorker::new(Arc::new(Silent), 2);
        let handle = worker.submit(&Handle::current(), vec![0.1; 512], 16000).unwrap();

        assert_eq!(handle.await.unwrap().unwrap_err(), InferenceError::EmptyResult);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let worker = InferenceWorker::new(Arc::new(LoopbackBackend::new()), 2);
        let result = worker.submit(&Handle::current(), Vec::new(), 16000);
        assert!(matches!(result, Err(InferenceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_queue_depth_bounds_requests() {
        let backend = Arc::new(LoopbackBackend::with_delay(Duration::from_millis(50)));
        let worker = InferenceWorker::new(backend, 2);
        let handle = Handle::current();

        let first = worker.submit(&handle, vec![0.1; 10], 16000).unwrap();
        let second = worker.submit(&handle, vec![0.1; 10], 16000).unwrap();
        assert_eq!(worker.in_flight(), 2);

        let third = worker.submit(&handle, vec![0.1; 10], 16000);
        assert!(matches!(third, Err(InferenceError::Busy(2))));
        assert_eq!(worker.rejected(), 1);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_inference_at_a_time() {
        let backend = Arc::new(Concurrency {
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let worker = InferenceWorker::new(backend.clone(), 4);
        let handle = Handle::current();

        let handles: Vec<_> = (0..4)
            .map(|_| worker.submit(&handle, vec![0.1; 10], 16000).unwrap())
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(backend.max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(worker.submitted(), 4);
    }

    #[tokio::test]
    async fn test_warm_up_runs() {
        let worker = InferenceWorker::new(Arc::new(LoopbackBackend::new()), 1);
        worker.spawn_warm_up(&Handle::current()).await.unwrap();
        assert_eq!(worker.backend_name(), "loopback");
    }
}
