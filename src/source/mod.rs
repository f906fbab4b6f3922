//! Sample Source abstraction
//!
//! The streaming scheduler pulls audio from a [`SampleSource`]: an external
//! collaborator (usually an emulated sound chip) that fills one channel of raw
//! floating point samples on request and knows nothing about timing.
//!
//! [`ChipSource`] adapts any [`SampleGenerator`] that produces a variable number of
//! samples per clock step into a fixed-block [`SampleSource`].

pub mod accumulator;
pub mod tone;

pub use accumulator::ChipSource;
pub use tone::SquareTone;

/// Block sizes accepted by chip sample sources, in frames
pub const BLOCK_SIZES: [usize; 5] = [512, 1024, 2048, 4096, 8192];

/// Common interface for pull-based sample sources
///
/// # Example
///
/// ```
/// use chipstream::{ChipSource, SampleSource, SquareTone};
///
/// let mut source = ChipSource::new(SquareTone::new(440.0, 0.5));
/// source.initialize_audio(1024, 44_100);
/// let block = source.sample_buffer().to_vec();
/// assert_eq!(block.len(), 1024);
/// ```
pub trait SampleSource {
    /// One-time setup before the first pull
    ///
    /// # Arguments
    ///
    /// * `buffer_size_frames` - Number of frames returned by each pull
    /// * `sample_rate_hz` - Output sample rate measured from the device
    fn initialize_audio(&mut self, buffer_size_frames: usize, sample_rate_hz: u32);

    /// Pull the next block of samples
    ///
    /// Returns the most recently generated block of `buffer_size_frames` mono samples,
    /// range approximately [-1.0, 1.0]. The region is reused by the next pull, so
    /// callers copy it out before pulling again.
    fn sample_buffer(&mut self) -> &[f32];
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn initialize_audio(&mut self, buffer_size_frames: usize, sample_rate_hz: u32) {
        (**self).initialize_audio(buffer_size_frames, sample_rate_hz);
    }

    fn sample_buffer(&mut self) -> &[f32] {
        (**self).sample_buffer()
    }
}

/// A generator clocked in steps, each producing zero or more samples
///
/// This is the shape of a chip emulator's run loop: one step advances the emulated
/// clock by some cycles and the resampler emits however many output samples fall
/// inside that window.
pub trait SampleGenerator {
    /// Configure the output sample rate; resets any resampling state
    fn configure(&mut self, sample_rate_hz: u32);

    /// Advance one step, appending generated samples to `out`
    fn step(&mut self, out: &mut Vec<f32>);
}

impl<G: SampleGenerator + ?Sized> SampleGenerator for Box<G> {
    fn configure(&mut self, sample_rate_hz: u32) {
        (**self).configure(sample_rate_hz);
    }

    fn step(&mut self, out: &mut Vec<f32>) {
        (**self).step(out);
    }
}

/// Snap a requested buffer length to the nearest supported block size at or below it
///
/// Requests below the smallest size yield the smallest size.
pub fn quantize_block_size(frames: usize) -> usize {
    BLOCK_SIZES
        .iter()
        .rev()
        .copied()
        .find(|&size| frames >= size)
        .unwrap_or(BLOCK_SIZES[0])
}
