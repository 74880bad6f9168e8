//! Application entry point — voice-stream.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Parse the command line and load [`AppConfig`] (defaults are written on
//!    first run).
//! 3. Produce the sample source: a WAV file or a synthesised tone.
//! 4. Build the cpal-backed graph and the [`AudioEngine`].
//! 5. `setup` → `start` → `speak_stream`, then wait until speaking ends or
//!    Ctrl-C is pressed.
//! 6. Shut the engine down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use voice_stream::{
    audio::{CaptureBuffer, CpalGraph},
    config::{AppConfig, AppPaths},
    pipeline::{AudioEngine, EngineConfig, EngineDelegate, SessionOutcome},
};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Stream audio to the default output device through the speech engine.
#[derive(Parser, Debug)]
#[command(name = "voice-stream", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a settings file (default: platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Keep the microphone gate closed
    #[arg(long, global = true)]
    mute: bool,

    /// Frames per batch handed to the engine
    #[arg(long, global = true, value_name = "FRAMES", default_value_t = 4_800)]
    batch_frames: usize,

    /// Conversion window in milliseconds (overrides the settings file)
    #[arg(long, global = true, value_name = "MS")]
    chunk_ms: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a WAV file (multi-channel files are mixed down to mono)
    Play {
        /// WAV file to play
        path: PathBuf,
    },
    /// Play a sine tone at the configured source rate
    Tone {
        /// Frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,
        /// Duration in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,
    },
}

// ---------------------------------------------------------------------------
// Sample sources
// ---------------------------------------------------------------------------

/// Read a WAV file as mono `f32` samples, returning them with the file's
/// sample rate.
fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        bail!("WAV file {} has no channels", path.display());
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .context("failed to read WAV samples")?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .context("failed to read WAV samples")?
        }
    };

    Ok((downmix(&interleaved, spec.channels), spec.sample_rate))
}

/// Average interleaved channels into one.
fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = usize::from(channels);
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn tone(frequency: f32, seconds: f32, sample_rate: u32) -> Vec<f32> {
    let frames = (seconds.max(0.0) * sample_rate as f32) as usize;
    (0..frames)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            0.3 * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Split `samples` into batches as a generator would produce them.
fn batches(samples: &[f32], batch_frames: usize) -> Vec<Result<Vec<f32>>> {
    samples
        .chunks(batch_frames.max(1))
        .map(|batch| Ok(batch.to_vec()))
        .collect()
}

// ---------------------------------------------------------------------------
// Delegate
// ---------------------------------------------------------------------------

/// Logs engine activity.
struct LoggingDelegate;

impl EngineDelegate for LoggingDelegate {
    fn on_capture_buffer(&self, buffer: &CaptureBuffer) {
        log::debug!(
            "capture: {} samples @ {} Hz, {} ch",
            buffer.samples.len(),
            buffer.format.sample_rate,
            buffer.format.channels
        );
    }

    fn on_speaking_changed(&self, speaking: bool) {
        log::info!("speaking: {speaking}");
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

/// Load settings from `explicit` or the platform config dir.  On first run
/// the defaults are written out so there is a file to edit.
fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return AppConfig::load_from(path);
    }
    if !AppConfig::is_first_run() {
        return AppConfig::load();
    }

    let config = AppConfig::default();
    match config.save() {
        Ok(()) => log::info!(
            "first run: wrote default settings to {}",
            AppPaths::new().settings_file.display()
        ),
        Err(e) => log::warn!("first run: could not write default settings: {e:#}"),
    }
    Ok(config)
}

/// Resolves on Ctrl-C.  Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging (RUST_LOG overrides the default)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 2. Configuration
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if cli.mute {
        config.capture.start_muted = true;
    }
    if let Some(ms) = cli.chunk_ms {
        config.playback.chunk_duration_ms = ms;
    }

    // 3. Sample source
    let samples = match &cli.command {
        Commands::Play { path } => {
            let (samples, rate) = read_wav(path)?;
            config.playback.source_sample_rate = rate;
            samples
        }
        Commands::Tone { frequency, seconds } => {
            tone(*frequency, *seconds, config.playback.source_sample_rate)
        }
    };
    log::info!(
        "source: {} frames @ {} Hz",
        samples.len(),
        config.playback.source_sample_rate
    );

    // 4. Engine
    let graph = CpalGraph::new().context("no usable audio output")?;
    let engine = AudioEngine::new(Box::new(graph), EngineConfig::from(&config));
    engine.set_delegate(Some(Arc::new(LoggingDelegate))).await;
    engine.setup().await?;
    engine.start().await?;

    // 5. Speak
    let stream = futures::stream::iter(batches(&samples, cli.batch_frames));
    let session = engine.speak_stream(stream).await?;
    match engine
        .wait_for_session(session, Duration::from_millis(50), ctrl_c())
        .await?
    {
        SessionOutcome::Finished => {}
        SessionOutcome::Replaced => log::warn!("playback of {session} was interrupted"),
        SessionOutcome::Interrupted => log::info!("interrupted, playback stopped"),
    }

    // 6. Teardown
    engine.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
