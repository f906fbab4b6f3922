//! Simulated output sink
//!
//! A manual-clock [`OutputSink`] for tests and headless runs. The device clock
//! only moves when the owner calls [`SimulatedOutput::advance`] and only while the
//! sink is running. Every submitted block is recorded; completion events are
//! queued in end-time order once the clock passes a block's end.

use super::sink::{
    BlockId, GainId, OutputBackend, OutputSink, Route, ScheduledBlock, SinkEvent, SinkState,
};
use super::StreamConfig;
use crate::{Result, StreamError};

/// Record of a block handed to a [`SimulatedOutput`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmittedBlock {
    /// Sink identifier
    pub id: BlockId,
    /// Requested start instant
    pub start_time: f64,
    /// Device clock at submission
    pub submitted_at: f64,
    /// Number of frames
    pub frames: usize,
    /// Connection target
    pub route: Route,
    /// Largest absolute sample value
    pub peak: f32,
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    id: BlockId,
    end: f64,
}

/// Manual-clock output sink
#[derive(Debug)]
pub struct SimulatedOutput {
    clock: f64,
    sample_rate: u32,
    state: SinkState,
    gains: Vec<f32>,
    voices: Vec<Voice>,
    events: Vec<SinkEvent>,
    next_block: u64,
    history: Vec<SubmittedBlock>,
    resume_failures: u32,
    reject_blocks: bool,
}

impl SimulatedOutput {
    /// Create a suspended sink with its clock at zero
    pub fn new(sample_rate: u32) -> Self {
        SimulatedOutput {
            clock: 0.0,
            sample_rate: sample_rate.max(1),
            state: SinkState::Suspended,
            gains: Vec::new(),
            voices: Vec::new(),
            events: Vec::new(),
            next_block: 0,
            history: Vec::new(),
            resume_failures: 0,
            reject_blocks: false,
        }
    }

    /// Make the next `count` resume requests fail
    pub fn fail_next_resumes(&mut self, count: u32) {
        self.resume_failures = count;
    }

    /// Refuse (or accept again) scheduled blocks
    pub fn reject_blocks(&mut self, reject: bool) {
        self.reject_blocks = reject;
    }

    /// Advance the device clock by `secs` if running
    pub fn advance(&mut self, secs: f64) {
        if self.state != SinkState::Running || secs <= 0.0 {
            return;
        }
        self.clock += secs;
        self.finish_voices();
    }

    /// Advance the device clock up to `time` if running
    pub fn advance_to(&mut self, time: f64) {
        if self.state != SinkState::Running || time <= self.clock {
            return;
        }
        self.clock = time;
        self.finish_voices();
    }

    /// Device-side pause (e.g. the OS took the output away)
    pub fn interrupt(&mut self) {
        if self.state == SinkState::Running {
            self.set_state(SinkState::Suspended);
        }
    }

    /// Every block submitted so far, in submission order
    pub fn history(&self) -> &[SubmittedBlock] {
        &self.history
    }

    /// Blocks routed through a gain stage
    pub fn audio_blocks(&self) -> impl Iterator<Item = &SubmittedBlock> + '_ {
        self.history
            .iter()
            .filter(|block| matches!(block.route, Route::Gain(_)))
    }

    /// Blocks routed straight to the destination
    pub fn destination_blocks(&self) -> impl Iterator<Item = &SubmittedBlock> + '_ {
        self.history
            .iter()
            .filter(|block| block.route == Route::Destination)
    }

    /// Number of gain stages created
    pub fn gain_count(&self) -> usize {
        self.gains.len()
    }

    /// Volume of a gain stage
    pub fn gain_volume(&self, gain: GainId) -> Option<f32> {
        self.gains.get(gain.0 as usize).copied()
    }

    /// Blocks scheduled but not yet finished
    pub fn active_blocks(&self) -> usize {
        self.voices.len()
    }

    fn set_state(&mut self, state: SinkState) {
        if self.state != state {
            self.state = state;
            self.events.push(SinkEvent::StateChanged(state));
        }
    }

    fn finish_voices(&mut self) {
        self.voices.sort_by(|a, b| a.end.total_cmp(&b.end));
        let finished = self
            .voices
            .iter()
            .take_while(|voice| voice.end <= self.clock)
            .count();
        for voice in self.voices.drain(..finished) {
            self.events.push(SinkEvent::Ended(voice.id));
        }
    }
}

impl OutputSink for SimulatedOutput {
    fn current_time(&self) -> f64 {
        self.clock
    }

    fn state(&self) -> SinkState {
        self.state
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn resume(&mut self) -> Result<()> {
        if self.state == SinkState::Closed {
            return Err(StreamError::AudioDeviceError("output is closed".into()));
        }
        if self.resume_failures > 0 {
            self.resume_failures -= 1;
            return Err(StreamError::AudioDeviceError("resume rejected".into()));
        }
        self.set_state(SinkState::Running);
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        if self.state == SinkState::Closed {
            return Err(StreamError::AudioDeviceError("output is closed".into()));
        }
        self.set_state(SinkState::Suspended);
        Ok(())
    }

    fn close(&mut self) {
        self.voices.clear();
        self.set_state(SinkState::Closed);
    }

    fn create_gain(&mut self, volume: f32) -> GainId {
        self.gains.push(volume);
        GainId((self.gains.len() - 1) as u32)
    }

    fn set_gain(&mut self, gain: GainId, volume: f32) {
        if let Some(slot) = self.gains.get_mut(gain.0 as usize) {
            *slot = volume;
        }
    }

    fn schedule(&mut self, block: ScheduledBlock, route: Route) -> Result<BlockId> {
        if self.state == SinkState::Closed {
            return Err(StreamError::AudioDeviceError("output is closed".into()));
        }
        if self.reject_blocks {
            return Err(StreamError::AudioDeviceError("block rejected".into()));
        }

        let id = BlockId(self.next_block);
        self.next_block += 1;

        let start = block.start_time().max(self.clock);
        let end = start + block.duration_secs(self.sample_rate);
        self.voices.push(Voice { id, end });
        self.history.push(SubmittedBlock {
            id,
            start_time: block.start_time(),
            submitted_at: self.clock,
            frames: block.len(),
            route,
            peak: block.samples().iter().fold(0.0f32, |peak, s| peak.max(s.abs())),
        });
        Ok(id)
    }

    fn poll_events(&mut self, events: &mut Vec<SinkEvent>) {
        events.append(&mut self.events);
    }
}

/// Opens [`SimulatedOutput`] sinks
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    sample_rate: u32,
    unsupported: bool,
    open_failures: u32,
    resume_failures: u32,
    start_running: bool,
    opened: u32,
}

impl SimulatedBackend {
    /// Backend whose sinks run at `sample_rate` and start suspended
    pub fn new(sample_rate: u32) -> Self {
        SimulatedBackend {
            sample_rate,
            unsupported: false,
            open_failures: 0,
            resume_failures: 0,
            start_running: false,
            opened: 0,
        }
    }

    /// Backend reporting a host without audio output
    pub fn unsupported() -> Self {
        SimulatedBackend {
            unsupported: true,
            ..Self::new(44_100)
        }
    }

    /// Fail the first `count` open attempts
    pub fn with_open_failures(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    /// Sinks reject their first `count` resume requests
    pub fn with_resume_failures(mut self, count: u32) -> Self {
        self.resume_failures = count;
        self
    }

    /// Sinks are already running when opened
    pub fn start_running(mut self) -> Self {
        self.start_running = true;
        self
    }

    /// Number of sinks successfully opened
    pub fn open_count(&self) -> u32 {
        self.opened
    }
}

impl OutputBackend for SimulatedBackend {
    type Sink = SimulatedOutput;

    fn open(&mut self, _config: &StreamConfig) -> Result<SimulatedOutput> {
        if self.unsupported {
            return Err(StreamError::Unsupported(
                "simulated host has no audio output".into(),
            ));
        }
        if self.open_failures > 0 {
            self.open_failures -= 1;
            return Err(StreamError::AudioDeviceError("device busy".into()));
        }

        self.opened += 1;
        let mut sink = SimulatedOutput::new(self.sample_rate);
        sink.fail_next_resumes(self.resume_failures);
        if self.start_running {
            sink.state = SinkState::Running;
        }
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sink: &mut SimulatedOutput) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        sink.poll_events(&mut events);
        events
    }

    #[test]
    fn test_clock_frozen_while_suspended() {
        let mut sink = SimulatedOutput::new(44_100);
        sink.advance(1.0);
        assert_eq!(sink.current_time(), 0.0);

        sink.resume().unwrap();
        sink.advance(1.0);
        assert_eq!(sink.current_time(), 1.0);
    }

    #[test]
    fn test_state_changes_are_reported_once() {
        let mut sink = SimulatedOutput::new(44_100);
        sink.resume().unwrap();
        sink.resume().unwrap();
        sink.interrupt();
        sink.close();
        assert_eq!(
            drain(&mut sink),
            vec![
                SinkEvent::StateChanged(SinkState::Running),
                SinkEvent::StateChanged(SinkState::Suspended),
                SinkEvent::StateChanged(SinkState::Closed),
            ]
        );
        assert!(sink.resume().is_err(), "closed sinks never resume");
    }

    #[test]
    fn test_blocks_end_in_end_time_order() {
        let mut sink = SimulatedOutput::new(1000);
        sink.resume().unwrap();
        drain(&mut sink);

        let late = sink
            .schedule(ScheduledBlock::silence(100, 0.5), Route::Destination)
            .unwrap();
        let early = sink
            .schedule(ScheduledBlock::silence(100, 0.2), Route::Destination)
            .unwrap();

        sink.advance_to(0.35);
        assert_eq!(drain(&mut sink), vec![SinkEvent::Ended(early)]);
        sink.advance_to(0.65);
        assert_eq!(drain(&mut sink), vec![SinkEvent::Ended(late)]);
        assert_eq!(sink.active_blocks(), 0);
    }

    #[test]
    fn test_past_start_plays_from_submission() {
        let mut sink = SimulatedOutput::new(1000);
        sink.resume().unwrap();
        sink.advance_to(2.0);
        drain(&mut sink);

        let id = sink
            .schedule(ScheduledBlock::silence(100, 1.0), Route::Destination)
            .unwrap();
        sink.advance_to(2.05);
        assert!(drain(&mut sink).is_empty());
        sink.advance_to(2.15);
        assert_eq!(drain(&mut sink), vec![SinkEvent::Ended(id)]);
    }

    #[test]
    fn test_history_records_route_and_peak() {
        let mut sink = SimulatedOutput::new(44_100);
        let gain = sink.create_gain(0.8);
        sink.schedule(ScheduledBlock::new(vec![0.1, -0.6, 0.3], 0.0), Route::Gain(gain))
            .unwrap();

        let record = sink.history()[0];
        assert_eq!(record.frames, 3);
        assert_eq!(record.route, Route::Gain(gain));
        assert_eq!(record.peak, 0.6);
        assert_eq!(sink.audio_blocks().count(), 1);
        assert_eq!(sink.destination_blocks().count(), 0);
    }

    #[test]
    fn test_backend_failures() {
        let config = StreamConfig::default();
        assert!(matches!(
            SimulatedBackend::unsupported().open(&config),
            Err(StreamError::Unsupported(_))
        ));

        let mut backend = SimulatedBackend::new(48_000).with_open_failures(1);
        assert!(backend.open(&config).is_err());
        let sink = backend.open(&config).expect("second open succeeds");
        assert_eq!(sink.sample_rate(), 48_000);
        assert_eq!(sink.state(), SinkState::Suspended);
        assert_eq!(backend.open_count(), 1);
    }
}
