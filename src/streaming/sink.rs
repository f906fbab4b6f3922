//! Output Sink abstraction
//!
//! An [`OutputSink`] is the platform's scheduled-playback primitive: it owns a
//! device clock, accepts mono blocks with absolute start instants, routes them
//! through gain stages, and reports each block's completion as an event.
//! An [`OutputBackend`] opens sinks lazily, on the first start attempt.

use super::StreamConfig;
use crate::Result;
use std::fmt;

/// Lifecycle state of an output sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkState {
    /// Created but not rendering; the device clock does not advance
    Suspended,
    /// Rendering scheduled blocks
    Running,
    /// Torn down; no transition out of this state
    Closed,
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkState::Suspended => "suspended",
            SinkState::Running => "running",
            SinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identifies a block submitted to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

/// Identifies a gain stage created on a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GainId(pub u32);

/// Where a scheduled block is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Through a gain stage to the physical output
    Gain(GainId),
    /// Straight to the physical output at unity gain
    Destination,
}

/// One unit of audio committed to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBlock {
    samples: Vec<f32>,
    start_time: f64,
}

impl ScheduledBlock {
    /// Create a block starting at `start_time` on the device clock
    pub fn new(samples: Vec<f32>, start_time: f64) -> Self {
        ScheduledBlock {
            samples,
            start_time,
        }
    }

    /// A block of `frames` zero samples
    pub fn silence(frames: usize, start_time: f64) -> Self {
        Self::new(vec![0.0; frames], start_time)
    }

    /// Mono sample payload
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Absolute start instant in device seconds
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the block holds no frames
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback time at `sample_rate_hz`
    pub fn duration_secs(&self, sample_rate_hz: u32) -> f64 {
        self.samples.len() as f64 / sample_rate_hz as f64
    }

    /// Take ownership of the samples
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Notification queued by a sink for the session to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// A submitted block finished playing
    Ended(BlockId),
    /// The sink moved to a new lifecycle state
    StateChanged(SinkState),
}

/// Platform scheduled-audio primitive
///
/// All methods are called from the session's thread. Implementations that render
/// on a separate audio thread must only touch shared timeline state from there.
pub trait OutputSink {
    /// Device clock in seconds; monotonic and independent of wall-clock time
    fn current_time(&self) -> f64;

    /// Current lifecycle state
    fn state(&self) -> SinkState;

    /// Actual device sample rate
    fn sample_rate(&self) -> u32;

    /// Request a transition to [`SinkState::Running`]
    fn resume(&mut self) -> Result<()>;

    /// Request a transition to [`SinkState::Suspended`]
    fn suspend(&mut self) -> Result<()>;

    /// Tear the sink down; pending blocks are discarded
    fn close(&mut self);

    /// Create a gain stage connected to the physical output
    fn create_gain(&mut self, volume: f32) -> GainId;

    /// Change a gain stage's volume
    fn set_gain(&mut self, gain: GainId, volume: f32);

    /// Schedule a block to start at its start instant
    ///
    /// A block whose start instant is already in the past starts immediately.
    /// Its completion is reported as [`SinkEvent::Ended`].
    fn schedule(&mut self, block: ScheduledBlock, route: Route) -> Result<BlockId>;

    /// Move queued notifications into `events`
    fn poll_events(&mut self, events: &mut Vec<SinkEvent>);
}

/// Opens output sinks for a session
pub trait OutputBackend {
    /// Sink type produced by this backend
    type Sink: OutputSink;

    /// Open a sink
    ///
    /// Returns [`StreamError::Unsupported`](crate::StreamError::Unsupported) when the
    /// host has no audio output capability at all.
    fn open(&mut self, config: &StreamConfig) -> Result<Self::Sink>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_block_duration() {
        let block = ScheduledBlock::silence(4096, 1.0);
        assert_eq!(block.len(), 4096);
        assert!(!block.is_empty());
        assert_abs_diff_eq!(block.duration_secs(44_100), 0.092879, epsilon = 1e-6);
        assert_eq!(block.start_time(), 1.0);
    }

    #[test]
    fn test_sink_state_display() {
        assert_eq!(SinkState::Running.to_string(), "running");
        assert_eq!(SinkState::Suspended.to_string(), "suspended");
        assert_eq!(SinkState::Closed.to_string(), "closed");
    }
}
