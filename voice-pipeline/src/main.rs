/// Voice pipeline service binary
///
/// Runs the pipeline on the default audio devices (or a WAV file with
/// `--replay <path>`) and takes control commands on stdin.

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use voice_pipeline::{
    AudioIo, CommandResult, CpalAudioIo, DetectorSet, EventSink, LogSink, LoopbackBackend,
    PipelineConfig, ReplayAudioIo, ResultCallback, StopOutcome, VoicePipeline,
};

const HELP: &str = "commands: start | stop | cancel | status | devices | reinit | reload | quit";

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout is written from a worker thread so the
    // audio callback never blocks on the terminal
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_pipeline=debug".parse()?),
        )
        .with_writer(writer)
        .init();

    info!("Starting AetherOS Voice Pipeline Service");

    let replay = parse_args()?;
    let config = PipelineConfig::load().context("Failed to load configuration")?;

    let mut pipeline = build_pipeline(config, replay.as_deref())?;
    pipeline.start().context("Failed to start voice pipeline")?;

    info!("Voice pipeline running. {}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match handle_command(line.trim(), &mut pipeline, replay.as_deref()) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => error!("Command '{}' failed: {:#}", line.trim(), e),
                },
                Ok(None) => {
                    info!("stdin closed; running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    pipeline.stop();
    info!("Voice pipeline service stopped");
    Ok(())
}

/// `--replay <wav>` is the only flag
fn parse_args() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut replay = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--replay" => {
                let path = args.next().context("--replay needs a WAV file path")?;
                replay = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("usage: voice-service [--replay <file.wav>]\n{}", HELP);
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {}", other),
        }
    }

    Ok(replay)
}

fn open_audio(config: &PipelineConfig, replay: Option<&Path>) -> anyhow::Result<Arc<dyn AudioIo>> {
    match replay {
        Some(path) => {
            let audio = ReplayAudioIo::open(path, config.device.clone())
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Arc::new(audio))
        }
        None => Ok(Arc::new(CpalAudioIo::new(config.device.clone()))),
    }
}

fn build_pipeline(
    config: PipelineConfig,
    replay: Option<&Path>,
) -> anyhow::Result<Arc<VoicePipeline>> {
    let audio = open_audio(&config, replay)?;
    let detectors = DetectorSet::energy(&config.detector);
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];

    let pipeline = VoicePipeline::new(
        config,
        audio,
        Arc::new(LoopbackBackend::new()),
        detectors,
        sinks,
        Handle::current(),
    )
    .context("Failed to build voice pipeline")?;

    pipeline.set_result_callback(result_logger());
    Ok(pipeline)
}

fn result_logger() -> ResultCallback {
    Arc::new(|result: &CommandResult| {
        info!(
            "Command result: {} frames recorded, {} samples played{}",
            result.recorded_frames,
            result.response_samples,
            result
                .text
                .as_deref()
                .map(|text| format!(" ({})", text))
                .unwrap_or_default()
        );
    })
}

fn handle_command(
    command: &str,
    pipeline: &mut Arc<VoicePipeline>,
    replay: Option<&Path>,
) -> anyhow::Result<Flow> {
    match command {
        "" => {}
        "start" => {
            if !pipeline.trigger()? {
                info!("Interaction already in progress");
            }
        }
        "stop" => match pipeline.stop_recording() {
            StopOutcome::Dispatched(handle) => {
                tokio::spawn(async move {
                    match handle.await {
                        Ok(outcome) => info!("Interaction finished: {:?}", outcome),
                        Err(e) => error!("Interaction task failed: {}", e),
                    }
                });
            }
            StopOutcome::TooShort { frames } => info!("Recording too short ({} frames)", frames),
            StopOutcome::NotRecording => info!("Not recording"),
            StopOutcome::Failed(message) => error!("Interaction failed: {}", message),
        },
        "cancel" => {
            if !pipeline.cancel() {
                info!("Nothing to cancel");
            }
        }
        "status" => println!("{}", serde_json::to_string_pretty(&pipeline.status())?),
        "devices" => {
            for device in pipeline.list_devices()? {
                println!(
                    "[{}] {} (input: {}, output: {}, {} Hz)",
                    device.index,
                    device.name,
                    device.supports_input,
                    device.supports_output,
                    device.default_sample_rate
                );
            }
        }
        "reinit" => info!("Engine state after reinitialize: {:?}", pipeline.reinitialize()),
        "reload" => {
            let config = PipelineConfig::load().context("Failed to reload configuration")?;
            let audio = open_audio(&config, replay)?;
            let detectors = DetectorSet::energy(&config.detector);

            let next = pipeline.reconfigure(config, audio, detectors)?;
            next.set_result_callback(result_logger());
            next.start()?;
            *pipeline = next;
            info!("Configuration reloaded");
        }
        "help" => println!("{}", HELP),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unknown command '{}'. {}", other, HELP),
    }

    Ok(Flow::Continue)
}
