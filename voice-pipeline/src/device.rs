/// Audio device I/O
///
/// `AudioIo` owns the capture and playback streams. Capture hands fixed-size
/// mono frames to a callback on the backend's realtime thread; playback
/// accepts whole responses from the control side and returns how long the
/// queued audio will take to drain.
///
/// `CpalAudioIo` keeps its cpal streams on a dedicated thread because cpal
/// streams cannot move between threads. Playback goes through a lock-free
/// ring whose consumer lives inside the output callback.

use crate::config::DeviceConfig;
use crate::dsp::resample;
use crate::error::{PipelineError, Result};
use crate::frame::{AudioFrame, AudioSample};
use crate::history::AudioHistory;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use parking_lot::{Mutex, RwLock};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-frame callback, invoked on the realtime thread
pub type FrameCallback = Box<dyn FnMut(&AudioFrame<'_>) + Send + 'static>;

/// Receives stream errors reported by the audio backend
pub type FaultCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Entry returned by device enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub supports_input: bool,
    pub supports_output: bool,
    pub default_sample_rate: u32,
}

/// Capture and playback device
pub trait AudioIo: Send + Sync {
    /// Open the streams and begin delivering frames to `on_frame`
    fn start(&self, on_frame: FrameCallback) -> Result<()>;

    fn stop(&self);

    /// Queue a response for playback at `sample_rate`
    ///
    /// Returns the duration of everything queued. With no output stream open
    /// this logs and returns zero.
    fn play_audio(&self, samples: &[AudioSample], sample_rate: u32) -> Result<Duration>;

    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Drop the rolling input history
    fn clear_buffer(&self);

    /// Drain the rolling input history
    fn take_buffered_audio(&self) -> Vec<AudioSample>;

    fn is_running(&self) -> bool;

    fn set_fault_handler(&self, handler: FaultCallback);
}

/// Builds fixed-length mono frames from arbitrary hardware chunks
///
/// The scratch buffer is allocated once; emitting a frame never allocates.
pub struct FrameAssembler {
    scratch: Vec<AudioSample>,
    frame_length: usize,
    channels: usize,
    sample_rate: u32,
    sequence: u64,
    history: Arc<AudioHistory>,
    on_frame: FrameCallback,
    panics: u64,
}

impl FrameAssembler {
    pub fn new(
        frame_length: usize,
        channels: u16,
        sample_rate: u32,
        history: Arc<AudioHistory>,
        on_frame: FrameCallback,
    ) -> Self {
        Self {
            scratch: Vec::with_capacity(frame_length.max(1)),
            frame_length: frame_length.max(1),
            channels: usize::from(channels.max(1)),
            sample_rate,
            sequence: 0,
            history,
            on_frame,
            panics: 0,
        }
    }

    /// Feed interleaved samples as delivered by the backend
    pub fn push_interleaved(&mut self, data: &[AudioSample]) {
        for chunk in data.chunks(self.channels) {
            let sample = if chunk.len() == 1 {
                chunk[0]
            } else {
                chunk.iter().sum::<f32>() / chunk.len() as f32
            };

            self.scratch.push(sample);
            if self.scratch.len() == self.frame_length {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        self.history.push(&self.scratch);

        let frame = AudioFrame::new(&self.scratch, self.sample_rate, self.sequence);
        let on_frame = &mut self.on_frame;
        if catch_unwind(AssertUnwindSafe(|| on_frame(&frame))).is_err() {
            self.panics += 1;
            if self.panics == 1 || self.panics % 100 == 0 {
                warn!("Frame callback panicked ({} times)", self.panics);
            }
        }

        self.sequence += 1;
        self.scratch.clear();
    }

    /// Frames emitted so far
    pub fn frames_emitted(&self) -> u64 {
        self.sequence
    }
}

type PlaybackProducer = <HeapRb<AudioSample> as Split>::Prod;

struct PlaybackQueue {
    producer: PlaybackProducer,
    sample_rate: u32,
}

struct StreamWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Streams owned by the audio thread
struct OpenStreams {
    _input: cpal::Stream,
    _output: Option<cpal::Stream>,
}

/// cpal-backed device
pub struct CpalAudioIo {
    config: DeviceConfig,
    history: Arc<AudioHistory>,
    playback: Mutex<Option<PlaybackQueue>>,
    worker: Mutex<Option<StreamWorker>>,
    fault_handler: Arc<RwLock<Option<FaultCallback>>>,
}

impl CpalAudioIo {
    pub fn new(config: DeviceConfig) -> Self {
        let history = Arc::new(AudioHistory::new(config.history_secs, config.sample_rate));
        Self {
            config,
            history,
            playback: Mutex::new(None),
            worker: Mutex::new(None),
            fault_handler: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<AudioHistory> {
        &self.history
    }

    /// Enumerate host devices in index order
    pub fn enumerate() -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let devices = host
            .devices()
            .map_err(|e| PipelineError::Device(e.to_string()))?;

        let infos = devices
            .enumerate()
            .map(|(index, device)| {
                let supports_input = device
                    .supported_input_configs()
                    .map(|mut configs| configs.next().is_some())
                    .unwrap_or(false);
                let supports_output = device
                    .supported_output_configs()
                    .map(|mut configs| configs.next().is_some())
                    .unwrap_or(false);

                let default_config = if supports_input {
                    device.default_input_config().ok()
                } else {
                    device.default_output_config().ok()
                };

                DeviceInfo {
                    index,
                    name: device.name().unwrap_or_else(|_| format!("device {}", index)),
                    supports_input,
                    supports_output,
                    default_sample_rate: default_config.map(|c| c.sample_rate().0).unwrap_or(0),
                }
            })
            .collect();

        Ok(infos)
    }

    fn report_fault(faults: &RwLock<Option<FaultCallback>>, message: String) {
        let handler = faults.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => error!("Audio stream error with no fault handler: {}", message),
        }
    }
}

fn select_device(host: &cpal::Host, index: Option<usize>, input: bool) -> Result<cpal::Device> {
    let direction = if input { "input" } else { "output" };

    if let Some(index) = index {
        let mut devices = host
            .devices()
            .map_err(|e| PipelineError::Device(e.to_string()))?;
        return devices.nth(index).ok_or_else(|| {
            PipelineError::Device(format!("no {} device at index {}", direction, index))
        });
    }

    let device = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    device.ok_or_else(|| PipelineError::Device(format!("no {} device available", direction)))
}

fn input_stream_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let range = device
        .supported_input_configs()
        .map_err(|e| PipelineError::Device(e.to_string()))?
        .filter(|c| {
            c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .min_by_key(|c| c.channels())
        .ok_or_else(|| {
            PipelineError::Device(format!("no f32 input config at {} Hz", sample_rate))
        })?;

    Ok(range.with_sample_rate(rate).config())
}

/// Preferred rate if supported, otherwise the device default (f32 only)
fn output_stream_config(device: &cpal::Device, preferred_rate: u32) -> Option<StreamConfig> {
    let rate = SampleRate(preferred_rate);
    let preferred = device.supported_output_configs().ok().and_then(|configs| {
        configs
            .filter(|c| {
                c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            })
            .min_by_key(|c| c.channels())
    });

    if let Some(range) = preferred {
        return Some(range.with_sample_rate(rate).config());
    }

    device
        .default_output_config()
        .ok()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .map(|c| c.config())
}

fn open_streams(
    config: &DeviceConfig,
    history: Arc<AudioHistory>,
    on_frame: FrameCallback,
    faults: Arc<RwLock<Option<FaultCallback>>>,
) -> Result<(OpenStreams, Option<PlaybackQueue>)> {
    let host = cpal::default_host();

    let input_device = select_device(&host, config.input_device, true)?;
    let input_config = input_stream_config(&input_device, config.sample_rate)?;

    debug!(
        device = input_device.name().unwrap_or_default(),
        sample_rate = config.sample_rate,
        channels = input_config.channels,
        "opening capture stream"
    );

    let mut assembler = FrameAssembler::new(
        config.frame_length,
        input_config.channels,
        config.sample_rate,
        history,
        on_frame,
    );

    let input_faults = Arc::clone(&faults);
    let input = input_device
        .build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                assembler.push_interleaved(data);
            },
            move |err| {
                error!(error = %err, "audio capture error");
                CpalAudioIo::report_fault(&input_faults, err.to_string());
            },
            None,
        )
        .map_err(|e| PipelineError::Device(e.to_string()))?;

    input
        .play()
        .map_err(|e| PipelineError::Device(e.to_string()))?;

    let (output, playback) = match open_output(config, faults) {
        Ok(Some((stream, queue))) => (Some(stream), Some(queue)),
        Ok(None) => (None, None),
        Err(e) => {
            warn!("Playback unavailable: {}", e);
            (None, None)
        }
    };

    Ok((
        OpenStreams {
            _input: input,
            _output: output,
        },
        playback,
    ))
}

fn open_output(
    config: &DeviceConfig,
    faults: Arc<RwLock<Option<FaultCallback>>>,
) -> Result<Option<(cpal::Stream, PlaybackQueue)>> {
    let host = cpal::default_host();
    let device = select_device(&host, config.output_device, false)?;

    let Some(stream_config) = output_stream_config(&device, config.output_sample_rate) else {
        warn!("No f32 output config available, playback disabled");
        return Ok(None);
    };

    let sample_rate = stream_config.sample_rate.0;
    let channels = usize::from(stream_config.channels.max(1));
    let capacity = (sample_rate as usize * config.playback_buffer_secs as usize).max(1);
    let (producer, mut consumer) = HeapRb::<AudioSample>::new(capacity).split();

    debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "opening playback stream"
    );

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = consumer.try_pop().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            move |err| {
                error!(error = %err, "audio playback error");
                CpalAudioIo::report_fault(&faults, err.to_string());
            },
            None,
        )
        .map_err(|e| PipelineError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PipelineError::Device(e.to_string()))?;

    Ok(Some((
        stream,
        PlaybackQueue {
            producer,
            sample_rate,
        },
    )))
}

impl AudioIo for CpalAudioIo {
    fn start(&self, on_frame: FrameCallback) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Audio device already running");
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Option<PlaybackQueue>>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let config = self.config.clone();
        let history = Arc::clone(&self.history);
        let faults = Arc::clone(&self.fault_handler);

        let thread = std::thread::Builder::new()
            .name("audio-io".to_string())
            .spawn(move || {
                let streams = match open_streams(&config, history, on_frame, faults) {
                    Ok((streams, playback)) => {
                        let _ = ready_tx.send(Ok(playback));
                        streams
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until stop() (or the device is dropped)
                let _ = stop_rx.recv();
                drop(streams);
                debug!("Audio streams closed");
            })
            .map_err(|e| PipelineError::Device(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(playback)) => {
                if playback.is_none() {
                    warn!("No output stream open; responses will not be played");
                }
                *self.playback.lock() = playback;
                *worker = Some(StreamWorker { stop_tx, thread });
                info!("Audio device started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(PipelineError::Device(
                    "audio thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        let _ = worker.stop_tx.send(());
        if worker.thread.join().is_err() {
            error!("Audio thread panicked during shutdown");
        }
        *self.playback.lock() = None;
        info!("Audio device stopped");
    }

    fn play_audio(&self, samples: &[AudioSample], sample_rate: u32) -> Result<Duration> {
        let output_rate = self.playback.lock().as_ref().map(|q| q.sample_rate);
        let Some(output_rate) = output_rate else {
            warn!("Output stream not open, dropping {} samples", samples.len());
            return Ok(Duration::ZERO);
        };

        let resampled = resample(samples, sample_rate, output_rate)
            .map_err(|e| PipelineError::Playback(e.to_string()))?;

        let mut playback = self.playback.lock();
        let Some(queue) = playback.as_mut() else {
            warn!("Output stream closed while preparing playback");
            return Ok(Duration::ZERO);
        };

        let written = queue.producer.push_slice(&resampled);
        if written < resampled.len() {
            if written == 0 {
                return Err(PipelineError::Playback("playback queue full".to_string()));
            }
            warn!(
                "Playback queue full, truncated response to {} of {} samples",
                written,
                resampled.len()
            );
        }

        let queued = queue.producer.occupied_len();
        Ok(Duration::from_secs_f64(
            queued as f64 / f64::from(queue.sample_rate),
        ))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Self::enumerate()
    }

    fn clear_buffer(&self) {
        self.history.clear();
    }

    fn take_buffered_audio(&self) -> Vec<AudioSample> {
        self.history.take()
    }

    fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    fn set_fault_handler(&self, handler: FaultCallback) {
        *self.fault_handler.write() = Some(handler);
    }
}

impl Drop for CpalAudioIo {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting(frames: Arc<Mutex<Vec<(u64, Vec<f32>)>>>) -> FrameCallback {
        Box::new(move |frame: &AudioFrame<'_>| {
            frames.lock().push((frame.sequence(), frame.samples().to_vec()));
        })
    }

    #[test]
    fn test_assembler_builds_fixed_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let history = Arc::new(AudioHistory::with_capacity(1024, 16000));
        let mut assembler = FrameAssembler::new(4, 1, 16000, history.clone(), collecting(frames.clone()));

        // Uneven chunks from the backend
        assembler.push_interleaved(&[0.1, 0.2, 0.3]);
        assembler.push_interleaved(&[0.4, 0.5]);
        assembler.push_interleaved(&[0.6, 0.7, 0.8, 0.9]);

        let frames = frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (0, vec![0.1, 0.2, 0.3, 0.4]));
        assert_eq!(frames[1], (1, vec![0.5, 0.6, 0.7, 0.8]));

        // Only whole frames reach the history
        assert_eq!(history.len(), 8);
        assert_eq!(assembler.frames_emitted(), 2);
    }

    #[test]
    fn test_assembler_downmixes_stereo() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let history = Arc::new(AudioHistory::with_capacity(64, 16000));
        let mut assembler = FrameAssembler::new(2, 2, 16000, history, collecting(frames.clone()));

        assembler.push_interleaved(&[0.2, 0.4, -1.0, 1.0]);

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!((frames[0].1[0] - 0.3).abs() < 1e-6);
        assert!(frames[0].1[1].abs() < 1e-6);
    }

    #[test]
    fn test_assembler_survives_callback_panic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: FrameCallback = Box::new(move |_frame: &AudioFrame<'_>| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first frame explodes");
            }
        });

        let history = Arc::new(AudioHistory::with_capacity(64, 16000));
        let mut assembler = FrameAssembler::new(2, 1, 16000, history, callback);
        assembler.push_interleaved(&[0.0; 6]);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(assembler.frames_emitted(), 3);
    }

    #[test]
    fn test_play_without_output_is_noop() {
        let io = CpalAudioIo::new(DeviceConfig::default());
        let queued = io.play_audio(&[0.1; 100], 24000).unwrap();

        assert_eq!(queued, Duration::ZERO);
        assert!(!io.is_running());
    }

    #[test]
    fn test_history_accessors() {
        let io = CpalAudioIo::new(DeviceConfig::default());
        io.history().push(&[0.5; 32]);

        assert_eq!(io.take_buffered_audio().len(), 32);
        io.history().push(&[0.5; 32]);
        io.clear_buffer();
        assert!(io.take_buffered_audio().is_empty());
    }
}
