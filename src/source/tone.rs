//! Square tone generator
//!
//! A frame-paced square wave: each step renders one display frame worth of
//! samples (50 Hz by default, the PAL vertical blank rate), which is how a chip
//! emulator driven by its VBL interrupt hands audio back to the host.

use super::SampleGenerator;

/// Default frame rate in Hz
pub const DEFAULT_FRAME_RATE_HZ: f32 = 50.0;

/// Square wave generator stepped one frame at a time
#[derive(Debug, Clone)]
pub struct SquareTone {
    frequency_hz: f32,
    amplitude: f32,
    frame_rate_hz: f32,
    sample_rate_hz: u32,
    /// Phase in cycles, [0, 1)
    phase: f32,
    /// Fractional samples carried between frames
    frame_remainder: f32,
}

impl SquareTone {
    /// Create a tone at `frequency_hz` with peak `amplitude`
    pub fn new(frequency_hz: f32, amplitude: f32) -> Self {
        SquareTone {
            frequency_hz,
            amplitude: amplitude.clamp(0.0, 1.0),
            frame_rate_hz: DEFAULT_FRAME_RATE_HZ,
            sample_rate_hz: 44_100,
            phase: 0.0,
            frame_remainder: 0.0,
        }
    }

    /// Override the frame rate (samples per step = sample rate / frame rate)
    pub fn with_frame_rate(mut self, frame_rate_hz: f32) -> Self {
        self.frame_rate_hz = frame_rate_hz.max(1.0);
        self
    }

    /// Change the tone frequency; phase is preserved
    pub fn set_frequency(&mut self, frequency_hz: f32) {
        self.frequency_hz = frequency_hz;
    }

    /// Current tone frequency
    pub fn frequency(&self) -> f32 {
        self.frequency_hz
    }

    /// Change the peak amplitude, clamped to [0, 1]
    pub fn set_amplitude(&mut self, amplitude: f32) {
        self.amplitude = amplitude.clamp(0.0, 1.0);
    }

    /// Samples the next step will produce (may vary by one between frames)
    pub fn samples_per_frame(&self) -> f32 {
        self.sample_rate_hz as f32 / self.frame_rate_hz
    }
}

impl SampleGenerator for SquareTone {
    fn configure(&mut self, sample_rate_hz: u32) {
        self.sample_rate_hz = sample_rate_hz.max(1);
        self.phase = 0.0;
        self.frame_remainder = 0.0;
    }

    fn step(&mut self, out: &mut Vec<f32>) {
        let exact = self.samples_per_frame() + self.frame_remainder;
        let count = exact.floor();
        self.frame_remainder = exact - count;

        let increment = self.frequency_hz / self.sample_rate_hz as f32;
        for _ in 0..count as usize {
            let level = if self.phase < 0.5 {
                self.amplitude
            } else {
                -self.amplitude
            };
            out.push(level);
            self.phase = (self.phase + increment).fract();
        }
    }
}
