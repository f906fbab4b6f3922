//! Scheduled audio streaming
//!
//! This module keeps an output device fed with timestamped blocks pulled from a
//! [`SampleSource`](crate::SampleSource):
//! - [`StreamScheduler`]: look-ahead, stall detection and backoff
//! - [`AudioSession`]: output lifecycle, gain stage and the two service drivers
//! - [`OutputSink`]: the scheduled-buffer primitive a platform backend provides

pub mod scheduler;
pub mod session;
pub mod simulated;
pub mod sink;
pub mod tick;

#[cfg(feature = "streaming")]
pub mod audio_device;

pub use scheduler::{SchedulerState, ServiceOutcome, StreamScheduler};
pub use session::{AudioSession, LifecycleState, SessionStats};
pub use simulated::{SimulatedBackend, SimulatedOutput, SubmittedBlock};
pub use sink::{
    BlockId, GainId, OutputBackend, OutputSink, Route, ScheduledBlock, SinkEvent, SinkState,
};
pub use tick::PeriodicTick;

#[cfg(feature = "streaming")]
pub use audio_device::{DeviceBackend, DeviceOutput};

use crate::source::BLOCK_SIZES;
use crate::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default block size in frames
pub const DEFAULT_BUFFER_SIZE_FRAMES: usize = 4096;

/// Default number of no-op service calls after a detected stall
pub const DEFAULT_PAUSE_BACKOFF_TICKS: u32 = 10;

/// Default gain stage volume
pub const DEFAULT_VOLUME: f32 = 0.8;

/// Default periodic tick interval in milliseconds
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 4;

/// Configuration for a streaming session
///
/// Durations expressed in "buffers" are multiples of one block's playback time
/// (`buffer_size_frames / sample_rate`), which is only known once the output
/// device reports its sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames per scheduled block (512, 1024, 2048, 4096 or 8192)
    /// Typical: 4096 frames ≈ 93ms @ 44.1kHz
    pub buffer_size_frames: usize,

    /// Service calls skipped after a stall is detected
    pub pause_backoff_ticks: u32,

    /// Gain stage volume in [0, 1]
    pub volume: f32,

    /// Maximum look-ahead before submission is held back, in buffers
    pub lookahead_buffers: f64,

    /// Gap between service calls treated as a stall, in buffers
    pub stall_threshold_buffers: f64,

    /// Lead between the device clock and the first scheduled block, in buffers
    pub initial_lead_buffers: f64,

    /// Timer block length is `buffer_size_frames / timer_block_divisor`
    pub timer_block_divisor: usize,

    /// Period of the redundant external tick in milliseconds
    pub tick_interval_ms: u64,

    /// Move the schedule up to the device clock after it fell behind
    pub resync_on_underrun: bool,
}

impl StreamConfig {
    /// Create a streaming configuration optimized for low latency
    /// Buffer = 2048 frames ≈ 46ms @ 44.1kHz
    pub fn low_latency() -> Self {
        StreamConfig {
            buffer_size_frames: 2048,
            ..Self::default()
        }
    }

    /// Create a streaming configuration optimized for stability
    /// Buffer = 8192 frames ≈ 186ms @ 44.1kHz
    pub fn stable() -> Self {
        StreamConfig {
            buffer_size_frames: 8192,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check every field against its accepted range
    pub fn validate(&self) -> Result<()> {
        if !BLOCK_SIZES.contains(&self.buffer_size_frames) {
            return Err(StreamError::ConfigError(format!(
                "buffer_size_frames must be one of {BLOCK_SIZES:?}, got {}",
                self.buffer_size_frames
            )));
        }
        if !self.volume.is_finite() || !(0.0..=1.0).contains(&self.volume) {
            return Err(StreamError::ConfigError(format!(
                "volume must be within [0, 1], got {}",
                self.volume
            )));
        }
        for (name, value) in [
            ("lookahead_buffers", self.lookahead_buffers),
            ("stall_threshold_buffers", self.stall_threshold_buffers),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(StreamError::ConfigError(format!(
                    "{name} must be a positive number of buffers, got {value}"
                )));
            }
        }
        if !self.initial_lead_buffers.is_finite() || self.initial_lead_buffers < 0.0 {
            return Err(StreamError::ConfigError(format!(
                "initial_lead_buffers must not be negative, got {}",
                self.initial_lead_buffers
            )));
        }
        if self.timer_block_divisor == 0 || self.timer_block_divisor > self.buffer_size_frames {
            return Err(StreamError::ConfigError(format!(
                "timer_block_divisor must be within 1..={}, got {}",
                self.buffer_size_frames, self.timer_block_divisor
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(StreamError::ConfigError(
                "tick_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Playback time of one block at `sample_rate_hz`, in seconds
    pub fn buffer_duration_secs(&self, sample_rate_hz: u32) -> f64 {
        self.buffer_size_frames as f64 / sample_rate_hz as f64
    }

    /// Length of the silent timer block in frames
    pub fn timer_block_frames(&self) -> usize {
        (self.buffer_size_frames / self.timer_block_divisor).max(1)
    }

    /// Period of the external tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            buffer_size_frames: DEFAULT_BUFFER_SIZE_FRAMES,
            pause_backoff_ticks: DEFAULT_PAUSE_BACKOFF_TICKS,
            volume: DEFAULT_VOLUME,
            lookahead_buffers: 2.0,
            stall_threshold_buffers: 2.0,
            initial_lead_buffers: 3.0,
            timer_block_divisor: 4,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            resync_on_underrun: true,
        }
    }
}
