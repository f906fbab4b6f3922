//! Streaming scheduler
//!
//! Decides, on each service opportunity, whether to pull and submit the next
//! block. Look-ahead is capped at a few buffer durations ahead of the device
//! clock; a gap between service calls longer than the stall threshold arms a
//! backoff window so that servicing resumes without a burst of submissions.
//!
//! Every decision reads only the sink's clock and state, so the two service
//! drivers (completion events and the periodic tick) can call in any order: a
//! second call right after a submission sees enough look-ahead and returns.

use super::sink::{BlockId, OutputSink, Route, ScheduledBlock, SinkState};
use super::StreamConfig;
use crate::source::SampleSource;
use tracing::{debug, warn};

/// All mutable timing state of one output session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerState {
    /// Frames per block
    pub buffer_size_frames: usize,
    /// Device sample rate
    pub sample_rate_hz: u32,
    /// `buffer_size_frames / sample_rate_hz`
    pub buffer_duration_secs: f64,
    /// Start instant of the most recent block, or the seeded lead point (device seconds)
    pub next_play_time: f64,
    /// Device time of the previous service call, if any since the last seed
    pub last_service_time: Option<f64>,
    /// Remaining no-op service calls after a stall
    pub pause_backoff_count: u32,
}

/// Result of one service call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServiceOutcome {
    /// A block was pulled and handed to the sink
    Submitted {
        /// Sink identifier of the block
        block: BlockId,
        /// Scheduled start instant
        start_time: f64,
    },
    /// The gap since the previous call exceeded the stall threshold
    Stalled {
        /// Device seconds since the previous call
        elapsed: f64,
    },
    /// Skipped while the post-stall backoff window drains
    BackingOff {
        /// Calls left in the window
        remaining: u32,
    },
    /// Enough audio is already scheduled
    Buffered {
        /// Scheduled time remaining ahead of the device clock
        lookahead: f64,
    },
    /// The sink refused the block
    SubmitFailed,
    /// The sink is not running (or no sink/nodes exist yet)
    NotRunning,
    /// The sink has been closed
    Closed,
}

impl ServiceOutcome {
    /// Whether a block was handed to the sink
    pub fn is_submitted(&self) -> bool {
        matches!(self, ServiceOutcome::Submitted { .. })
    }
}

/// Scheduling decision before any sample is pulled
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Decision {
    Skip(ServiceOutcome),
    Submit { start_time: f64 },
}

/// Look-ahead scheduler for one output session
#[derive(Debug, Clone)]
pub struct StreamScheduler {
    state: SchedulerState,
    pause_backoff_ticks: u32,
    lookahead_buffers: f64,
    stall_threshold_buffers: f64,
    initial_lead_buffers: f64,
    resync_on_underrun: bool,
    submitted_blocks: u64,
    underruns: u64,
}

impl StreamScheduler {
    /// Create a scheduler for a sink running at `sample_rate_hz`
    pub fn new(config: &StreamConfig, sample_rate_hz: u32) -> Self {
        StreamScheduler {
            state: SchedulerState {
                buffer_size_frames: config.buffer_size_frames,
                sample_rate_hz,
                buffer_duration_secs: config.buffer_duration_secs(sample_rate_hz),
                next_play_time: 0.0,
                last_service_time: None,
                pause_backoff_count: 0,
            },
            pause_backoff_ticks: config.pause_backoff_ticks,
            lookahead_buffers: config.lookahead_buffers,
            stall_threshold_buffers: config.stall_threshold_buffers,
            initial_lead_buffers: config.initial_lead_buffers,
            resync_on_underrun: config.resync_on_underrun,
            submitted_blocks: 0,
            underruns: 0,
        }
    }

    /// Current timing state
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Playback time of one block
    pub fn buffer_duration_secs(&self) -> f64 {
        self.state.buffer_duration_secs
    }

    /// Blocks handed to the sink since creation
    pub fn submitted_blocks(&self) -> u64 {
        self.submitted_blocks
    }

    /// Times the schedule had fallen behind the device clock
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Re-initialize timing state relative to the device clock `now`
    ///
    /// The first block is placed `initial_lead_buffers` durations ahead so setup
    /// latency is absorbed before steady-state servicing begins.
    pub fn seed(&mut self, now: f64) {
        self.state.next_play_time =
            now + self.initial_lead_buffers * self.state.buffer_duration_secs;
        self.state.last_service_time = None;
        self.state.pause_backoff_count = 0;
        debug!(
            now,
            next_play_time = self.state.next_play_time,
            "scheduler seeded"
        );
    }

    /// Service the stream once
    ///
    /// Reads the sink's clock and state, and when a block is due pulls exactly
    /// `buffer_size_frames` samples from `source` and schedules them on `route`.
    pub fn service<S, K>(&mut self, sink: &mut K, source: &mut S, route: Route) -> ServiceOutcome
    where
        S: SampleSource + ?Sized,
        K: OutputSink + ?Sized,
    {
        match sink.state() {
            SinkState::Running => {}
            SinkState::Suspended => return ServiceOutcome::NotRunning,
            SinkState::Closed => return ServiceOutcome::Closed,
        }

        // Schedule position before the advance, restored if the sink refuses the block
        let rollback = (self.state.next_play_time, self.underruns);
        let start_time = match self.decide(sink.current_time()) {
            Decision::Skip(outcome) => return outcome,
            Decision::Submit { start_time } => start_time,
        };

        let samples = self.pull_block(source);
        match sink.schedule(ScheduledBlock::new(samples, start_time), route) {
            Ok(block) => {
                self.submitted_blocks += 1;
                ServiceOutcome::Submitted { block, start_time }
            }
            Err(e) => {
                warn!(error = %e, start_time, "output sink rejected block");
                (self.state.next_play_time, self.underruns) = rollback;
                ServiceOutcome::SubmitFailed
            }
        }
    }

    /// Stall detection, backoff, look-ahead check and schedule advance
    pub(crate) fn decide(&mut self, now: f64) -> Decision {
        let duration = self.state.buffer_duration_secs;

        if let Some(last) = self.state.last_service_time {
            let elapsed = now - last;
            if elapsed > self.stall_threshold_buffers * duration {
                self.state.last_service_time = Some(now);
                self.state.pause_backoff_count = self.pause_backoff_ticks;
                debug!(
                    elapsed,
                    backoff = self.pause_backoff_ticks,
                    "service stall detected"
                );
                return Decision::Skip(ServiceOutcome::Stalled { elapsed });
            }
        }
        self.state.last_service_time = Some(now);

        if self.state.pause_backoff_count > 0 {
            self.state.pause_backoff_count -= 1;
            return Decision::Skip(ServiceOutcome::BackingOff {
                remaining: self.state.pause_backoff_count,
            });
        }

        if now + self.lookahead_buffers * duration < self.state.next_play_time {
            return Decision::Skip(ServiceOutcome::Buffered {
                lookahead: self.state.next_play_time - now,
            });
        }

        // The next block would start in the past: the device drained everything.
        if self.resync_on_underrun && self.state.next_play_time + duration < now {
            self.underruns += 1;
            debug!(
                behind = now - self.state.next_play_time,
                "schedule fell behind the device clock; resyncing"
            );
            self.state.next_play_time = now;
        }

        self.state.next_play_time += duration;
        Decision::Submit {
            start_time: self.state.next_play_time,
        }
    }

    /// Copy one block out of the source, padding or truncating to the block size
    fn pull_block<S: SampleSource + ?Sized>(&self, source: &mut S) -> Vec<f32> {
        let frames = self.state.buffer_size_frames;
        let mut samples = source.sample_buffer().to_vec();
        if samples.len() != frames {
            warn!(
                got = samples.len(),
                expected = frames,
                "sample source returned a short or long block"
            );
            samples.resize(frames, 0.0);
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::SimulatedOutput;
    use approx::assert_abs_diff_eq;

    /// Returns a constant block and counts pulls
    struct FixedSource {
        block: Vec<f32>,
        pulls: usize,
    }

    impl FixedSource {
        fn new(len: usize) -> Self {
            FixedSource {
                block: vec![0.5; len],
                pulls: 0,
            }
        }
    }

    impl SampleSource for FixedSource {
        fn initialize_audio(&mut self, _buffer_size_frames: usize, _sample_rate_hz: u32) {}

        fn sample_buffer(&mut self) -> &[f32] {
            self.pulls += 1;
            &self.block
        }
    }

    fn running_sink() -> SimulatedOutput {
        let mut sink = SimulatedOutput::new(44_100);
        sink.resume().expect("simulated resume");
        sink
    }

    fn scheduler() -> StreamScheduler {
        StreamScheduler::new(&StreamConfig::default(), 44_100)
    }

    #[test]
    fn test_concrete_scenario() {
        let mut sched = scheduler();
        assert_abs_diff_eq!(sched.buffer_duration_secs(), 0.0929, epsilon = 1e-4);

        sched.seed(0.0);
        assert_abs_diff_eq!(sched.state().next_play_time, 0.2786, epsilon = 1e-3);

        let mut sink = running_sink();
        sink.advance_to(0.30);
        let mut source = FixedSource::new(4096);
        let outcome = sched.service(&mut sink, &mut source, Route::Destination);

        let ServiceOutcome::Submitted { start_time, .. } = outcome else {
            panic!("expected a submission, got {outcome:?}");
        };
        assert_abs_diff_eq!(start_time, 0.3715, epsilon = 1e-3);
        assert_abs_diff_eq!(sched.state().next_play_time, 0.3715, epsilon = 1e-3);
        assert_eq!(source.pulls, 1);
        assert_eq!(sink.history().len(), 1);
        assert_eq!(sink.history()[0].frames, 4096);
    }

    #[test]
    fn test_rejected_block_leaves_no_gap() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let duration = sched.buffer_duration_secs();
        let mut sink = running_sink();
        let mut source = FixedSource::new(4096);

        sink.advance_to(0.20);
        let ServiceOutcome::Submitted { start_time: first, .. } =
            sched.service(&mut sink, &mut source, Route::Destination)
        else {
            panic!("expected the first block to be accepted");
        };

        sink.reject_blocks(true);
        sink.advance_to(0.22);
        assert_eq!(
            sched.service(&mut sink, &mut source, Route::Destination),
            ServiceOutcome::SubmitFailed
        );
        assert_abs_diff_eq!(sched.state().next_play_time, first, epsilon = 1e-12);

        sink.reject_blocks(false);
        sink.advance_to(0.23);
        let ServiceOutcome::Submitted { start_time: second, .. } =
            sched.service(&mut sink, &mut source, Route::Destination)
        else {
            panic!("expected the retried block to be accepted");
        };
        assert_abs_diff_eq!(second - first, duration, epsilon = 1e-12);
        assert_eq!(sched.submitted_blocks(), 2);
        assert_eq!(sched.underruns(), 0);
    }

    #[test]
    fn test_no_submit_under_sufficient_lookahead() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let before = sched.state().next_play_time;

        let mut sink = running_sink();
        sink.advance_to(0.05);
        let mut source = FixedSource::new(4096);
        let outcome = sched.service(&mut sink, &mut source, Route::Destination);

        assert!(matches!(outcome, ServiceOutcome::Buffered { .. }));
        assert_eq!(source.pulls, 0, "no samples pulled while buffered");
        assert_eq!(sched.state().next_play_time, before);
        assert!(sink.history().is_empty());
    }

    #[test]
    fn test_stall_arms_backoff() {
        let config = StreamConfig {
            pause_backoff_ticks: 3,
            ..StreamConfig::default()
        };
        let mut sched = StreamScheduler::new(&config, 44_100);
        sched.seed(0.0);
        let duration = sched.buffer_duration_secs();

        assert!(matches!(sched.decide(0.0), Decision::Skip(ServiceOutcome::Buffered { .. })));

        // Gap larger than two buffer durations.
        let stalled_at = 3.0 * duration;
        let outcome = sched.decide(stalled_at);
        assert!(matches!(outcome, Decision::Skip(ServiceOutcome::Stalled { .. })));
        assert_eq!(sched.state().pause_backoff_count, 3);

        // The following N calls never submit, even though the schedule is starved.
        for remaining in (0..3).rev() {
            let outcome = sched.decide(stalled_at + 0.001);
            assert_eq!(
                outcome,
                Decision::Skip(ServiceOutcome::BackingOff { remaining }),
            );
        }

        assert!(matches!(sched.decide(stalled_at + 0.002), Decision::Submit { .. }));
    }

    #[test]
    fn test_first_call_after_seed_is_not_a_stall() {
        let mut sched = scheduler();
        sched.seed(10.0);
        // No previous call: there is no elapsed time to measure.
        assert!(!matches!(
            sched.decide(10.5),
            Decision::Skip(ServiceOutcome::Stalled { .. })
        ));
    }

    #[test]
    fn test_simulated_pause_scenario() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let duration = sched.buffer_duration_secs();

        // Steady state for a while.
        let mut now = 0.0;
        while now < 1.0 {
            sched.decide(now);
            now += 0.01;
        }
        let submitted_before = sched.state().next_play_time;

        // Service calls at one-second intervals all register as stalls.
        for t in [2.0, 3.0, 4.0] {
            assert!(matches!(
                sched.decide(t),
                Decision::Skip(ServiceOutcome::Stalled { .. })
            ));
        }
        assert_eq!(sched.state().next_play_time, submitted_before);

        // Normal cadence again: backoff drains before anything is submitted.
        let mut now = 4.0;
        for _ in 0..10 {
            now += 0.01;
            assert!(matches!(
                sched.decide(now),
                Decision::Skip(ServiceOutcome::BackingOff { .. })
            ));
        }
        now += 0.01;
        let Decision::Submit { start_time } = sched.decide(now) else {
            panic!("submission should resume after backoff");
        };
        // Resynced to the device clock rather than scheduled in the past.
        assert_abs_diff_eq!(start_time, now + duration, epsilon = 1e-9);
        assert_eq!(sched.underruns(), 1);
    }

    #[test]
    fn test_steady_state_cadence() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let duration = sched.buffer_duration_secs();

        let mut starts = Vec::new();
        let mut now = 0.0;
        while now < 10.0 {
            if let Decision::Submit { start_time } = sched.decide(now) {
                starts.push(start_time);
            }
            now += 0.01;
        }

        for pair in starts.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], duration, epsilon = 1e-9);
        }
        // One block per buffer duration over ten seconds.
        let expected = 10.0 / duration;
        assert!(
            (starts.len() as f64 - expected).abs() <= 3.0,
            "{} blocks for ~{expected:.1} expected",
            starts.len()
        );
        assert_eq!(sched.underruns(), 0);
    }

    #[test]
    fn test_lookahead_capped_near_two_buffers() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let duration = sched.buffer_duration_secs();

        let mut now = 0.0;
        while now < 5.0 {
            sched.decide(now);
            let lookahead = sched.state().next_play_time - now;
            assert!(lookahead <= 3.0 * duration + 1e-9, "lookahead {lookahead}");
            now += 0.004;
        }
    }

    #[test]
    fn test_resync_disabled_keeps_schedule() {
        let config = StreamConfig {
            resync_on_underrun: false,
            ..StreamConfig::default()
        };
        let mut sched = StreamScheduler::new(&config, 44_100);
        sched.seed(0.0);
        let duration = sched.buffer_duration_secs();

        let Decision::Submit { start_time } = sched.decide(0.5) else {
            panic!("expected submission");
        };
        assert_abs_diff_eq!(start_time, 4.0 * duration, epsilon = 1e-9);
        assert_eq!(sched.underruns(), 0);
    }

    #[test]
    fn test_short_source_block_padded() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let mut sink = running_sink();
        sink.advance_to(0.3);
        let mut source = FixedSource::new(100);

        let outcome = sched.service(&mut sink, &mut source, Route::Destination);
        assert!(outcome.is_submitted());
        assert_eq!(sink.history()[0].frames, 4096);
    }

    #[test]
    fn test_inactive_sink_is_untouched() {
        let mut sched = scheduler();
        sched.seed(0.0);
        let before = *sched.state();
        let mut source = FixedSource::new(4096);

        let mut suspended = SimulatedOutput::new(44_100);
        assert_eq!(
            sched.service(&mut suspended, &mut source, Route::Destination),
            ServiceOutcome::NotRunning
        );

        let mut closed = running_sink();
        closed.close();
        assert_eq!(
            sched.service(&mut closed, &mut source, Route::Destination),
            ServiceOutcome::Closed
        );
        assert_eq!(*sched.state(), before);
        assert_eq!(source.pulls, 0);
    }
}
