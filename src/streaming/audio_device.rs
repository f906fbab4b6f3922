//! Audio device output using rodio
//!
//! [`DeviceOutput`] implements [`OutputSink`] on top of the system's default
//! output device. Scheduled blocks are mixed into a shared timeline that a rodio
//! source renders from the audio thread. The device clock is the number of frames
//! rendered so far divided by the device sample rate, so it stops while the
//! sink is paused.

use super::sink::{
    BlockId, GainId, OutputBackend, OutputSink, Route, ScheduledBlock, SinkEvent, SinkState,
};
use super::StreamConfig;
use crate::{Result, StreamError};
use parking_lot::Mutex;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Frames rendered per timeline lock
const RENDER_BATCH_FRAMES: usize = 512;

struct Voice {
    id: BlockId,
    start_frame: u64,
    samples: Vec<f32>,
    gain: Option<GainId>,
    position: usize,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    fn is_done(&self) -> bool {
        self.position >= self.samples.len()
    }
}

/// Mix state shared between the session thread and the audio thread
struct Timeline {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
    gains: Vec<f32>,
    ended: Vec<BlockId>,
}

impl Timeline {
    fn new(sample_rate: u32) -> Self {
        Timeline {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
            gains: Vec::new(),
            ended: Vec::new(),
        }
    }

    fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    fn add_voice(&mut self, id: BlockId, block: ScheduledBlock, gain: Option<GainId>) {
        let requested = (block.start_time() * self.sample_rate as f64).round();
        let start_frame = if requested.is_finite() && requested > 0.0 {
            (requested as u64).max(self.frames_rendered)
        } else {
            self.frames_rendered
        };
        self.voices.push(Voice {
            id,
            start_frame,
            samples: block.into_samples(),
            gain,
            position: 0,
        });
    }

    /// Mix every voice overlapping the next `out.len()` frames into `out`
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let base = self.frames_rendered;

        // Mix the part of each voice that falls inside this batch

        for voice in &mut self.voices {
            let offset = voice.start_frame.saturating_sub(base);
            if offset >= out.len() as u64 {
                continue;
            }
            let offset = offset as usize;
            let level = voice
                .gain
                .and_then(|gain| self.gains.get(gain.0 as usize).copied())
                .unwrap_or(1.0);

            let remaining = &voice.samples[voice.position..];
            let count = remaining.len().min(out.len() - offset);
            for (dst, src) in out[offset..offset + count].iter_mut().zip(remaining) {
                *dst += src * level;
            }
            voice.position += count;
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.frames_rendered += out.len() as u64;

        // Retire finished voices, reported in end order

        let mut done: Vec<(u64, BlockId)> = self
            .voices
            .iter()
            .filter(|voice| voice.is_done())
            .map(|voice| (voice.end_frame(), voice.id))
            .collect();
        if done.is_empty() {
            return;
        }
        done.sort_unstable();
        self.ended.extend(done.into_iter().map(|(_, id)| id));
        self.voices.retain(|voice| !voice.is_done());
    }
}

/// Rodio source rendering the shared timeline
struct TimelineSource {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    finished: Arc<AtomicBool>,
    buffer: Vec<f32>,
    buffer_pos: usize,
}

impl TimelineSource {
    fn new(timeline: Arc<Mutex<Timeline>>, sample_rate: u32, finished: Arc<AtomicBool>) -> Self {
        TimelineSource {
            timeline,
            sample_rate,
            finished,
            buffer: vec![0.0f32; RENDER_BATCH_FRAMES],
            buffer_pos: RENDER_BATCH_FRAMES,
        }
    }
}

impl Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        let left = self.buffer.len().saturating_sub(self.buffer_pos);
        Some(if left > 0 { left } else { RENDER_BATCH_FRAMES })
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.finished.load(Ordering::Relaxed) {
            return None;
        }

        // Refill internal buffer from the timeline (batch render)
        if self.buffer_pos >= self.buffer.len() {
            self.timeline.lock().render(&mut self.buffer);
            self.buffer_pos = 0;
        }

        let sample = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        Some(sample)
    }
}

/// Output sink on the system's default audio device
///
/// Opens paused in [`SinkState::Suspended`]; the session resumes it on start.
pub struct DeviceOutput {
    _stream: OutputStream,
    sink: Sink,
    timeline: Arc<Mutex<Timeline>>,
    finished: Arc<AtomicBool>,
    sample_rate: u32,
    state: SinkState,
    events: Vec<SinkEvent>,
    next_block: u64,
}

impl DeviceOutput {
    /// Open the default output device at its native sample rate
    pub fn open_default() -> Result<Self> {
        // Query the device first so the scheduler sees its native rate
        let host = rodio::cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| StreamError::Unsupported("no default audio output device".into()))?;
        let sample_rate = device
            .default_output_config()
            .map_err(|e| StreamError::Unsupported(format!("no usable output config: {}", e)))?
            .sample_rate()
            .0;

        // Create output stream and sink, held paused until resume
        let (stream, stream_handle) = OutputStream::try_from_device(&device).map_err(|e| {
            StreamError::AudioDeviceError(format!("Failed to create audio stream: {}", e))
        })?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| {
            StreamError::AudioDeviceError(format!("Failed to create audio sink: {}", e))
        })?;
        sink.pause();

        let timeline = Arc::new(Mutex::new(Timeline::new(sample_rate)));
        let finished = Arc::new(AtomicBool::new(false));
        sink.append(TimelineSource::new(
            Arc::clone(&timeline),
            sample_rate,
            Arc::clone(&finished),
        ));

        let name = device.name().unwrap_or_else(|_| "unknown".into());
        info!(
            device = %name,
            sample_rate,
            "audio device opened"
        );

        Ok(DeviceOutput {
            _stream: stream,
            sink,
            timeline,
            finished,
            sample_rate,
            state: SinkState::Suspended,
            events: Vec::new(),
            next_block: 0,
        })
    }

    fn set_state(&mut self, state: SinkState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "audio device state");
            self.state = state;
            self.events.push(SinkEvent::StateChanged(state));
        }
    }
}

impl OutputSink for DeviceOutput {
    fn current_time(&self) -> f64 {
        self.timeline.lock().current_time()
    }

    fn state(&self) -> SinkState {
        self.state
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn resume(&mut self) -> Result<()> {
        if self.state == SinkState::Closed {
            return Err(StreamError::AudioDeviceError("audio device is closed".into()));
        }
        self.sink.play();
        self.set_state(SinkState::Running);
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        if self.state == SinkState::Closed {
            return Err(StreamError::AudioDeviceError("audio device is closed".into()));
        }
        self.sink.pause();
        self.set_state(SinkState::Suspended);
        Ok(())
    }

    fn close(&mut self) {
        if self.state == SinkState::Closed {
            return;
        }
        self.finished.store(true, Ordering::Relaxed);
        self.sink.stop();
        {
            let mut timeline = self.timeline.lock();
            timeline.voices.clear();
            timeline.ended.clear();
        }
        self.set_state(SinkState::Closed);
    }

    fn create_gain(&mut self, volume: f32) -> GainId {
        let mut timeline = self.timeline.lock();
        timeline.gains.push(volume);
        GainId((timeline.gains.len() - 1) as u32)
    }

    fn set_gain(&mut self, gain: GainId, volume: f32) {
        if let Some(slot) = self.timeline.lock().gains.get_mut(gain.0 as usize) {
            *slot = volume;
        }
    }

    fn schedule(&mut self, block: ScheduledBlock, route: Route) -> Result<BlockId> {
        if self.state == SinkState::Closed {
            return Err(StreamError::AudioDeviceError("audio device is closed".into()));
        }
        let id = BlockId(self.next_block);
        self.next_block += 1;

        let gain = match route {
            Route::Gain(gain) => Some(gain),
            Route::Destination => None,
        };
        self.timeline.lock().add_voice(id, block, gain);
        Ok(id)
    }

    fn poll_events(&mut self, events: &mut Vec<SinkEvent>) {
        events.append(&mut self.events);
        events.extend(self.timeline.lock().ended.drain(..).map(SinkEvent::Ended));
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Relaxed);
        self.sink.pause();
    }
}

/// Opens [`DeviceOutput`] sinks on the default audio device
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceBackend;

impl DeviceBackend {
    /// Create a backend for the default device
    pub fn new() -> Self {
        DeviceBackend
    }
}

impl OutputBackend for DeviceBackend {
    type Sink = DeviceOutput;

    fn open(&mut self, _config: &StreamConfig) -> Result<DeviceOutput> {
        DeviceOutput::open_default()
    }
}
