/// File-driven audio device
///
/// Plays a WAV file into the pipeline as if it were a microphone: frames
/// arrive from a dedicated thread at the real-time cadence, the last partial
/// frame is padded, and silence follows until the device is stopped.
/// Playback requests are counted and discarded.

use crate::config::DeviceConfig;
use crate::device::{AudioIo, DeviceInfo, FaultCallback, FrameAssembler, FrameCallback};
use crate::dsp::resample;
use crate::error::{PipelineError, Result};
use crate::frame::{frame_duration, AudioSample};
use crate::history::AudioHistory;
use crate::wav::read_wav_mono;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct ReplayWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct ReplayAudioIo {
    name: String,
    samples: Arc<Vec<AudioSample>>,
    config: DeviceConfig,
    history: Arc<AudioHistory>,
    worker: Mutex<Option<ReplayWorker>>,
    paced: bool,
    plays: AtomicU64,
    played_samples: AtomicU64,
}

impl ReplayAudioIo {
    /// Load a WAV file, resampling to the capture rate if needed
    pub fn open(path: impl AsRef<Path>, config: DeviceConfig) -> Result<Self> {
        let path = path.as_ref();
        let (samples, rate) =
            read_wav_mono(path).map_err(|e| PipelineError::Device(e.to_string()))?;

        let samples = if rate != config.sample_rate {
            info!("Resampling replay file from {} Hz to {} Hz", rate, config.sample_rate);
            resample(&samples, rate, config.sample_rate)
                .map_err(|e| PipelineError::Device(e.to_string()))?
        } else {
            samples
        };

        Ok(Self::from_samples(
            format!("replay:{}", path.display()),
            samples,
            config,
        ))
    }

    /// Replay in-memory samples (already at the capture rate)
    pub fn from_samples(name: impl Into<String>, samples: Vec<AudioSample>, config: DeviceConfig) -> Self {
        let history = Arc::new(AudioHistory::new(config.history_secs, config.sample_rate));
        Self {
            name: name.into(),
            samples: Arc::new(samples),
            config,
            history,
            worker: Mutex::new(None),
            paced: true,
            plays: AtomicU64::new(0),
            played_samples: AtomicU64::new(0),
        }
    }

    /// Deliver the file as fast as possible instead of in real time
    ///
    /// Trailing silence is still paced.
    pub fn with_pacing(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Length of the source audio
    pub fn duration(&self) -> Duration {
        frame_duration(self.samples.len(), self.config.sample_rate)
    }

    /// Number of `play_audio` calls so far
    pub fn plays(&self) -> u64 {
        self.plays.load(Ordering::Relaxed)
    }

    pub fn played_samples(&self) -> u64 {
        self.played_samples.load(Ordering::Relaxed)
    }
}

fn run_replay(
    samples: Arc<Vec<AudioSample>>,
    config: DeviceConfig,
    history: Arc<AudioHistory>,
    on_frame: FrameCallback,
    stop: Arc<AtomicBool>,
    paced: bool,
) {
    let frame_length = config.frame_length;
    let cadence = frame_duration(frame_length, config.sample_rate);
    let silence = vec![0.0; frame_length];
    let mut assembler = FrameAssembler::new(frame_length, 1, config.sample_rate, history, on_frame);

    let mut offset = 0;
    let mut next_tick = Instant::now();

    while !stop.load(Ordering::Acquire) {
        let in_file = offset < samples.len();

        if in_file {
            let end = (offset + frame_length).min(samples.len());
            assembler.push_interleaved(&samples[offset..end]);
            let delivered = end - offset;
            if delivered < frame_length {
                assembler.push_interleaved(&silence[..frame_length - delivered]);
            }
            offset = end;
            if offset >= samples.len() {
                debug!("Replay source exhausted after {} frames", assembler.frames_emitted());
            }
        } else {
            assembler.push_interleaved(&silence);
        }

        if paced || !in_file {
            next_tick += cadence;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }
    }
}

impl AudioIo for ReplayAudioIo {
    fn start(&self, on_frame: FrameCallback) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Replay device already running");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let samples = Arc::clone(&self.samples);
            let config = self.config.clone();
            let history = Arc::clone(&self.history);
            let stop = Arc::clone(&stop);
            let paced = self.paced;

            std::thread::Builder::new()
                .name("audio-replay".to_string())
                .spawn(move || run_replay(samples, config, history, on_frame, stop, paced))
                .map_err(|e| PipelineError::Device(e.to_string()))?
        };

        info!(
            "Replaying {} ({:.1}s of audio)",
            self.name,
            self.duration().as_secs_f32()
        );
        *worker = Some(ReplayWorker { stop, thread });
        Ok(())
    }

    fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        worker.stop.store(true, Ordering::Release);
        if worker.thread.join().is_err() {
            warn!("Replay thread panicked");
        }
        info!("Replay stopped");
    }

    fn play_audio(&self, samples: &[AudioSample], sample_rate: u32) -> Result<Duration> {
        self.plays.fetch_add(1, Ordering::Relaxed);
        self.played_samples
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        debug!("Discarding {} playback samples at {} Hz", samples.len(), sample_rate);
        Ok(frame_duration(samples.len(), sample_rate))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            index: 0,
            name: self.name.clone(),
            supports_input: true,
            supports_output: true,
            default_sample_rate: self.config.sample_rate,
        }])
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

    fn set_fault_handler(&self, _handler: FaultCallback) {
        // Replay never faults
    }
}

impl Drop for ReplayAudioIo {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AudioFrame;
    use crate::wav::write_wav;
    use std::sync::mpsc;

    fn small_config() -> DeviceConfig {
        DeviceConfig {
            frame_length: 160,
            history_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_replay_delivers_file_then_silence() {
        let samples = vec![0.5; 400];
        let io = ReplayAudioIo::from_samples("test", samples, small_config()).with_pacing(false);

        let (tx, rx) = mpsc::channel();
        io.start(Box::new(move |frame: &AudioFrame<'_>| {
            let _ = tx.send((frame.sequence(), frame.samples().to_vec()));
        }))
        .unwrap();
        assert!(io.is_running());

        let frames: Vec<(u64, Vec<f32>)> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        io.stop();
        assert!(!io.is_running());

        assert_eq!(frames[0].0, 0);
        assert!(frames[0].1.iter().all(|&s| s == 0.5));
        assert!(frames[1].1.iter().all(|&s| s == 0.5));

        // 400 = 160 + 160 + 80, last partial frame padded with silence
        assert!(frames[2].1[..80].iter().all(|&s| s == 0.5));
        assert!(frames[2].1[80..].iter().all(|&s| s == 0.0));
        assert!(frames[3].1.iter().all(|&s| s == 0.0));
        assert!(frames.iter().all(|(_, f)| f.len() == 160));
    }

    #[test]
    fn test_replay_open_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utterance.wav");
        write_wav(&path, &vec![0.25; 16000], 16000).unwrap();

        let io = ReplayAudioIo::open(&path, DeviceConfig::default()).unwrap();
        assert!((io.duration().as_secs_f32() - 1.0).abs() < 0.01);

        let devices = io.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].name.starts_with("replay:"));
    }

    #[test]
    fn test_replay_playback_is_accounted() {
        let io = ReplayAudioIo::from_samples("test", Vec::new(), DeviceConfig::default());
        let queued = io.play_audio(&vec![0.1; 24000], 24000).unwrap();

        assert_eq!(queued, Duration::from_secs(1));
        assert_eq!(io.plays(), 1);
        assert_eq!(io.played_samples(), 24000);
    }
}
