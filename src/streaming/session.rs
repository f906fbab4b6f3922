//! Output session lifecycle
//!
//! [`AudioSession`] owns everything one output session needs: the backend that
//! opens the sink, the sink itself, the gain stage, the scheduler and the sample
//! source. It implements the start attempt and node setup, and forwards the two
//! service drivers into the scheduler:
//! - completion events of submitted blocks, including a short silent timer block
//!   that is re-submitted from its own completion
//! - a coarse periodic tick
//!
//! The session is single-threaded: call [`AudioSession::pump`] from one thread as
//! often as the host allows.

use super::scheduler::{ServiceOutcome, StreamScheduler};
use super::sink::{
    BlockId, GainId, OutputBackend, OutputSink, Route, ScheduledBlock, SinkEvent, SinkState,
};
use super::tick::PeriodicTick;
use super::StreamConfig;
use crate::source::SampleSource;
use crate::{Result, StreamError};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of the session's output handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No output handle has been created yet
    Unstarted,
    /// Handle exists but is not rendering
    Suspended,
    /// Handle is rendering
    Running,
    /// Handle was torn down; terminal
    Closed,
}

impl From<SinkState> for LifecycleState {
    fn from(state: SinkState) -> Self {
        match state {
            SinkState::Suspended => LifecycleState::Suspended,
            SinkState::Running => LifecycleState::Running,
            SinkState::Closed => LifecycleState::Closed,
        }
    }
}

/// Counters for monitoring a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Start attempts made
    pub start_attempts: u64,
    /// Resume requests the sink rejected
    pub resume_failures: u64,
    /// Service operation invocations
    pub service_calls: u64,
    /// Audio blocks handed to the sink
    pub blocks_submitted: u64,
    /// Stalls detected
    pub stalls: u64,
    /// Service calls skipped by the backoff window
    pub backoff_skips: u64,
    /// Blocks the sink refused
    pub submit_failures: u64,
    /// Timer blocks submitted
    pub timer_rearms: u64,
    /// Times the schedule was moved up to the device clock
    pub underruns: u64,
}

/// One output session: lifecycle manager plus scheduler drivers
pub struct AudioSession<S, B: OutputBackend> {
    config: StreamConfig,
    source: S,
    backend: B,
    sink: Option<B::Sink>,
    scheduler: Option<StreamScheduler>,
    gain: Option<GainId>,
    /// In-flight silent block driving the completion chain
    timer_block: Option<BlockId>,
    /// Submitted audio blocks awaiting completion
    pending: VecDeque<BlockId>,
    tick: PeriodicTick,
    observed_state: Option<SinkState>,
    events: Vec<SinkEvent>,
    stats: SessionStats,
}

impl<S: SampleSource, B: OutputBackend> AudioSession<S, B> {
    /// Create a session; no output is opened until [`start`](Self::start)
    pub fn new(config: StreamConfig, source: S, backend: B) -> Result<Self> {
        config.validate()?;
        Ok(AudioSession {
            tick: PeriodicTick::new(config.tick_interval()),
            config,
            source,
            backend,
            sink: None,
            scheduler: None,
            gain: None,
            timer_block: None,
            pending: VecDeque::new(),
            observed_state: None,
            events: Vec::new(),
            stats: SessionStats::default(),
        })
    }

    /// Start attempt; idempotent and safe to call repeatedly
    ///
    /// Opens the output on first use, deriving the block duration from the
    /// device's actual sample rate, and asks a non-running output to resume.
    /// Platforms may only allow audio to start from a user gesture, so hosts
    /// typically call this from input handlers and also poll it.
    pub fn start(&mut self) {
        if self.observed_state == Some(SinkState::Closed) {
            debug!("session closed; start ignored");
            return;
        }
        self.stats.start_attempts += 1;

        match self.sink.as_mut() {
            Some(sink) => {
                if sink.state() == SinkState::Suspended {
                    if let Err(e) = sink.resume() {
                        self.stats.resume_failures += 1;
                        warn!(error = %e, "output resume failed; will retry on next start");
                    }
                }
            }
            None => {
                if !self.open_output() {
                    return;
                }
            }
        }

        self.sync_state();
    }

    /// Node setup; runs once the output is confirmed running
    ///
    /// Creates the gain stage, initializes the sample source, seeds the
    /// scheduler ahead of the device clock, starts the timer chain and arms the
    /// periodic tick. Does nothing if the nodes already exist.
    pub fn setup_nodes(&mut self) {
        let (Some(sink), Some(scheduler)) = (self.sink.as_mut(), self.scheduler.as_mut()) else {
            return;
        };
        if sink.state() != SinkState::Running || self.gain.is_some() {
            return;
        }

        self.gain = Some(sink.create_gain(self.config.volume));

        let timing = *scheduler.state();
        self.source
            .initialize_audio(timing.buffer_size_frames, timing.sample_rate_hz);
        scheduler.seed(sink.current_time());

        info!(
            volume = self.config.volume,
            buffer_size = timing.buffer_size_frames,
            sample_rate = timing.sample_rate_hz,
            "audio nodes ready"
        );

        self.tick.arm();
        self.run_timer();
    }

    /// Service operation: submit the next block if one is due
    pub fn service(&mut self) -> ServiceOutcome {
        let Some(sink) = self.sink.as_mut() else {
            return ServiceOutcome::NotRunning;
        };
        self.stats.service_calls += 1;
        if sink.state() == SinkState::Closed {
            return ServiceOutcome::Closed;
        }
        let (Some(scheduler), Some(gain)) = (self.scheduler.as_mut(), self.gain) else {
            return ServiceOutcome::NotRunning;
        };

        let outcome = scheduler.service(sink, &mut self.source, Route::Gain(gain));
        match outcome {
            ServiceOutcome::Submitted { block, .. } => {
                self.pending.push_back(block);
                self.stats.blocks_submitted += 1;
            }
            ServiceOutcome::Stalled { .. } => self.stats.stalls += 1,
            ServiceOutcome::BackingOff { .. } => self.stats.backoff_skips += 1,
            ServiceOutcome::SubmitFailed => self.stats.submit_failures += 1,
            _ => {}
        }
        outcome
    }

    /// Drive the session: handle sink notifications and the periodic tick
    ///
    /// `now` is the host's monotonic time, used only for the tick. Returns the
    /// number of service calls made.
    pub fn pump(&mut self, now: Instant) -> usize {
        let Some(sink) = self.sink.as_mut() else {
            return 0;
        };

        // Completions left over from sync_state come first
        let mut events = std::mem::take(&mut self.events);
        sink.poll_events(&mut events);

        let mut serviced = 0;
        for event in events.drain(..) {
            match event {
                SinkEvent::StateChanged(state) => self.on_state_change(state),
                SinkEvent::Ended(id) if self.timer_block == Some(id) => {
                    self.timer_block = None;
                    self.run_timer();
                    serviced += 1;
                }
                SinkEvent::Ended(id) => {
                    if let Some(pos) = self.pending.iter().position(|&p| p == id) {
                        self.pending.remove(pos);
                        self.service();
                        serviced += 1;
                    }
                }
            }
        }
        self.events = events;
        self.sync_state();

        if self.tick.poll(now) {
            if self.timer_block.is_none() && self.gain.is_some() {
                debug!("timer chain not armed; re-arming from tick");
                self.run_timer();
            } else {
                self.service();
            }
            serviced += 1;
        }
        serviced
    }

    /// Ask the output to suspend (host-driven pause)
    pub fn suspend(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.suspend() {
                warn!(error = %e, "output suspend failed");
            }
        }
        self.sync_state();
    }

    /// Tear the session down; further service calls and completions exit early
    pub fn close(&mut self) {
        match self.sink.as_mut() {
            Some(sink) => {
                sink.close();
                self.sync_state();
            }
            None => self.on_state_change(SinkState::Closed),
        }
    }

    /// Change the gain stage volume, clamped to [0, 1]
    pub fn set_volume(&mut self, volume: f32) {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.config.volume = volume;
        if let (Some(sink), Some(gain)) = (self.sink.as_mut(), self.gain) {
            sink.set_gain(gain, volume);
        }
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> LifecycleState {
        if self.observed_state == Some(SinkState::Closed) {
            return LifecycleState::Closed;
        }
        match &self.sink {
            Some(sink) => sink.state().into(),
            None => LifecycleState::Unstarted,
        }
    }

    /// Session configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Scheduler, once the output's sample rate is known
    pub fn scheduler(&self) -> Option<&StreamScheduler> {
        self.scheduler.as_ref()
    }

    /// Output handle, once opened
    pub fn sink(&self) -> Option<&B::Sink> {
        self.sink.as_ref()
    }

    /// Mutable output handle, once opened
    pub fn sink_mut(&mut self) -> Option<&mut B::Sink> {
        self.sink.as_mut()
    }

    /// Sample source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable sample source
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Output backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Gain stage, once created
    pub fn gain(&self) -> Option<GainId> {
        self.gain
    }

    /// Whether a timer block is in flight
    pub fn timer_armed(&self) -> bool {
        self.timer_block.is_some()
    }

    /// Whether the periodic tick is armed
    pub fn tick_armed(&self) -> bool {
        self.tick.is_armed()
    }

    /// Audio blocks awaiting completion
    pub fn pending_blocks(&self) -> usize {
        self.pending.len()
    }

    /// Session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            underruns: self.scheduler.as_ref().map_or(0, |s| s.underruns()),
            ..self.stats
        }
    }

    fn open_output(&mut self) -> bool {
        let mut sink = match self.backend.open(&self.config) {
            Ok(sink) => sink,
            Err(StreamError::Unsupported(reason)) => {
                debug!(%reason, "no audio output on this host");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "failed to open audio output; will retry on next start");
                return false;
            }
        };

        // Block duration comes from the rate the device actually runs at
        let sample_rate = sink.sample_rate();
        let scheduler = StreamScheduler::new(&self.config, sample_rate);
        info!(
            sample_rate,
            buffer_ms = scheduler.buffer_duration_secs() * 1000.0,
            "audio output opened"
        );

        // Outputs usually open suspended until a user gesture allows playback
        if sink.state() == SinkState::Suspended {
            if let Err(e) = sink.resume() {
                self.stats.resume_failures += 1;
                warn!(error = %e, "output resume failed; will retry on next start");
            }
        }

        self.scheduler = Some(scheduler);
        self.sink = Some(sink);
        true
    }

    /// Service once, then re-submit the silent timer block
    fn run_timer(&mut self) {
        self.service();

        // Closed outputs end the chain here
        let frames = self.config.timer_block_frames();
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if sink.state() == SinkState::Closed {
            self.timer_block = None;
            return;
        }

        let block = ScheduledBlock::silence(frames, sink.current_time());
        match sink.schedule(block, Route::Destination) {
            Ok(id) => {
                self.timer_block = Some(id);
                self.stats.timer_rearms += 1;
            }
            Err(e) => {
                self.timer_block = None;
                warn!(error = %e, "timer block rejected; relying on periodic tick");
            }
        }
    }

    /// Apply queued state notifications in order, then the sink's current state
    ///
    /// Completion notifications stay queued for the next [`pump`](Self::pump), so a
    /// suspend followed by a resume is observed (and re-seeds) as soon as it happens.
    fn sync_state(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let mut events = std::mem::take(&mut self.events);
        sink.poll_events(&mut events);

        let mut completions = Vec::with_capacity(events.len());
        for event in events.drain(..) {
            match event {
                SinkEvent::StateChanged(state) => self.on_state_change(state),
                ended => completions.push(ended),
            }
        }
        self.events = completions;

        if let Some(state) = self.sink.as_ref().map(|sink| sink.state()) {
            self.on_state_change(state);
        }
    }

    fn on_state_change(&mut self, state: SinkState) {
        let previous = self.observed_state.replace(state);
        if previous == Some(state) {
            if state == SinkState::Running {
                self.setup_nodes();
            }
            return;
        }
        debug!(?previous, %state, "output state changed");

        match state {
            SinkState::Running => {
                if self.gain.is_some() {
                    // Timing restarts from the current device clock after a pause.
                    if let (Some(scheduler), Some(sink)) =
                        (self.scheduler.as_mut(), self.sink.as_ref())
                    {
                        scheduler.seed(sink.current_time());
                    }
                    info!("output resumed");
                }
                self.setup_nodes();
            }
            SinkState::Suspended => {
                info!("output suspended");
            }
            SinkState::Closed => {
                self.tick.disarm();
                self.timer_block = None;
                self.pending.clear();
                info!("output closed");
            }
        }
    }
}

impl<S, B> std::fmt::Debug for AudioSession<S, B>
where
    B: OutputBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSession")
            .field("config", &self.config)
            .field("observed_state", &self.observed_state)
            .field("scheduler", &self.scheduler)
            .field("gain", &self.gain)
            .field("timer_block", &self.timer_block)
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish()
    }
}
