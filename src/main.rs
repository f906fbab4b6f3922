//! chipstream demo CLI
//!
//! Plays a square tone through the look-ahead scheduler for a few seconds and
//! prints the session counters. Without the `streaming` feature (or with
//! `--simulate`) the output is a simulated device driven by the host clock.

use anyhow::{Context, Result};
use chipstream::{
    AudioSession, ChipSource, LifecycleState, OutputBackend, SessionStats, SimulatedBackend,
    SimulatedOutput, SquareTone, StreamConfig,
};
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sample rate of the simulated output
const SIMULATED_SAMPLE_RATE: u32 = 44_100;

/// Host loop sleep between pumps
const PUMP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Parser, Debug)]
#[command(name = "chipstream", version, about = "Stream a chip tone through the block scheduler")]
struct Args {
    /// Playback length in seconds
    #[arg(short, long, default_value_t = 5.0)]
    seconds: f64,

    /// Tone frequency in Hz
    #[arg(short, long, default_value_t = 440.0)]
    frequency: f32,

    /// Output volume in [0, 1]
    #[arg(short, long)]
    volume: Option<f32>,

    /// Frames per block (512, 1024, 2048, 4096 or 8192)
    #[arg(short, long)]
    buffer_size: Option<usize>,

    /// Service calls skipped after a stall
    #[arg(long)]
    backoff: Option<u32>,

    /// JSON stream configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the simulated output instead of the audio device
    #[arg(long)]
    simulate: bool,
}

impl Args {
    fn stream_config(&self) -> Result<StreamConfig> {
        let mut config = match &self.config {
            Some(path) => StreamConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StreamConfig::default(),
        };
        if let Some(frames) = self.buffer_size {
            config.buffer_size_frames = frames;
        }
        if let Some(ticks) = self.backoff {
            config.pause_backoff_ticks = ticks;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.stream_config()?;
    let source = ChipSource::new(SquareTone::new(args.frequency, 0.5));
    let seconds = args.seconds.max(0.0);

    info!(
        frequency = args.frequency,
        seconds,
        buffer_size = config.buffer_size_frames,
        "starting playback"
    );

    let stats = if args.simulate || !cfg!(feature = "streaming") {
        let backend = SimulatedBackend::new(SIMULATED_SAMPLE_RATE);
        let session = AudioSession::new(config, source, backend)?;
        run(session, seconds, |sink: &mut SimulatedOutput, elapsed: f64| {
            sink.advance_to(elapsed)
        })
    } else {
        run_device(config, source, seconds)?
    };

    print_stats(&stats);
    Ok(())
}

#[cfg(feature = "streaming")]
fn run_device(
    config: StreamConfig,
    source: ChipSource<SquareTone>,
    seconds: f64,
) -> Result<RunStats> {
    let session = AudioSession::new(config, source, chipstream::DeviceBackend::new())?;
    Ok(run(session, seconds, |_: &mut chipstream::DeviceOutput, _: f64| {}))
}

#[cfg(not(feature = "streaming"))]
fn run_device(
    _config: StreamConfig,
    _source: ChipSource<SquareTone>,
    _seconds: f64,
) -> Result<RunStats> {
    anyhow::bail!("device output requires the \"streaming\" feature")
}

struct RunStats {
    session: SessionStats,
    lifecycle: LifecycleState,
}

/// Drive a session from the host clock until `seconds` have passed
///
/// `drive_clock` receives the sink and the elapsed host time before each pump.
fn run<B: OutputBackend>(
    mut session: AudioSession<ChipSource<SquareTone>, B>,
    seconds: f64,
    mut drive_clock: impl FnMut(&mut B::Sink, f64),
) -> RunStats {
    let started = Instant::now();
    let deadline = Duration::from_secs_f64(seconds);

    session.start();
    loop {
        let now = Instant::now();
        let elapsed = now.duration_since(started);
        if elapsed >= deadline {
            break;
        }
        if session.lifecycle() != LifecycleState::Running {
            session.start();
        }
        if let Some(sink) = session.sink_mut() {
            drive_clock(sink, elapsed.as_secs_f64());
        }
        session.pump(now);
        thread::sleep(PUMP_INTERVAL);
    }

    let lifecycle = session.lifecycle();
    if lifecycle == LifecycleState::Unstarted {
        warn!("no audio output could be opened");
    }
    let stats = RunStats {
        session: session.stats(),
        lifecycle,
    };
    session.close();
    stats
}

fn print_stats(stats: &RunStats) {
    let s = &stats.session;
    println!("Output state:     {:?}", stats.lifecycle);
    println!("Blocks submitted: {}", s.blocks_submitted);
    println!("Service calls:    {}", s.service_calls);
    println!("Timer re-arms:    {}", s.timer_rearms);
    println!("Stalls:           {}", s.stalls);
    println!("Backoff skips:    {}", s.backoff_skips);
    println!("Underruns:        {}", s.underruns);
    println!("Submit failures:  {}", s.submit_failures);
}
