//! Scheduled audio streaming for emulated sound chips
//!
//! Bridges a synchronous, pull-based sample generator (an emulated sound chip that
//! produces samples on demand) to an output device that plays pre-scheduled,
//! timestamped buffers. The streaming scheduler decides when to pull the next block,
//! when to hand it to the device, how far ahead of the device clock to stay buffered,
//! and how to recover when host time and device time diverge.
//!
//! # Features
//! - Look-ahead block scheduling capped at a configurable number of buffer durations
//! - Stall detection with a configurable backoff window
//! - Self-perpetuating completion chain plus a coarse periodic tick
//! - Lazy output creation, resume handling and idempotent node setup
//! - Sample accumulator adapter for chip emulators that produce samples per clock step
//!
//! # Crate feature flags
//! - `streaming` (opt-in): real-time device output via rodio (`DeviceBackend`)
//!
//! # Quick start
//! ```no_run
//! use chipstream::{AudioSession, ChipSource, SimulatedBackend, SquareTone, StreamConfig};
//! use std::time::Instant;
//!
//! let source = ChipSource::new(SquareTone::new(440.0, 0.25));
//! let mut session =
//!     AudioSession::new(StreamConfig::default(), source, SimulatedBackend::new(44_100)).unwrap();
//!
//! // Safe to call as often as needed; the first call opens the output.
//! session.start();
//! loop {
//!     session.pump(Instant::now());
//!     # break;
//! }
//! ```

#![warn(missing_docs)]

pub mod source; // Sample Sources (chip adapters, generators)
pub mod streaming; // Scheduling, Output Sinks & Session Lifecycle

/// Error types for audio streaming operations
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// No audio output capability exists on this host
    #[error("Audio output unsupported: {0}")]
    Unsupported(String),

    /// Audio device error
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for StreamError {
    /// Converts a String into `StreamError::Other`.
    ///
    /// Prefer the specific variants (`ConfigError`, `AudioDeviceError`, `Unsupported`)
    /// where the failure class is known.
    fn from(msg: String) -> Self {
        StreamError::Other(msg)
    }
}

impl From<&str> for StreamError {
    /// Converts a string slice into `StreamError::Other`.
    fn from(msg: &str) -> Self {
        StreamError::Other(msg.to_string())
    }
}

/// Result type for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;

// Public API exports
pub use source::{quantize_block_size, ChipSource, SampleGenerator, SampleSource, SquareTone};
pub use streaming::{
    AudioSession, BlockId, GainId, LifecycleState, OutputBackend, OutputSink, PeriodicTick,
    Route, ScheduledBlock, SchedulerState, ServiceOutcome, SessionStats, SimulatedBackend,
    SimulatedOutput, SinkEvent, SinkState, StreamConfig, StreamScheduler,
};

#[cfg(feature = "streaming")]
pub use streaming::{DeviceBackend, DeviceOutput};
