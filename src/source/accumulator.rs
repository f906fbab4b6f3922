//! Chip sample accumulator
//!
//! Collects the samples a [`SampleGenerator`] emits per clock step and hands them
//! out in fixed-size blocks. A pull steps the generator until a full block is
//! pending, copies the block out, and shifts any remainder to the front.

use super::{quantize_block_size, SampleGenerator, SampleSource};
use tracing::{debug, warn};

/// Default output scale applied when copying a block out
pub const DEFAULT_OUTPUT_SCALE: f32 = 1.0;

/// Upper bound on generator steps per pull
pub const DEFAULT_MAX_STEPS: usize = 1_000_000;

/// Pending capacity, in blocks, before the accumulator resets
const PENDING_CAPACITY_BLOCKS: usize = 4;

/// Block-oriented [`SampleSource`] over a stepped [`SampleGenerator`]
#[derive(Debug)]
pub struct ChipSource<G> {
    generator: G,
    /// Samples generated but not yet handed out
    pending: Vec<f32>,
    /// Output block returned by [`SampleSource::sample_buffer`]
    block: Vec<f32>,
    block_len: usize,
    output_scale: f32,
    max_steps: usize,
    initialized: bool,
    overflow_count: u64,
}

impl<G: SampleGenerator> ChipSource<G> {
    /// Wrap a generator; block size defaults to 4096 frames until initialized
    pub fn new(generator: G) -> Self {
        let block_len = quantize_block_size(4096);
        ChipSource {
            generator,
            pending: Vec::with_capacity(block_len * PENDING_CAPACITY_BLOCKS),
            block: vec![0.0; block_len],
            block_len,
            output_scale: DEFAULT_OUTPUT_SCALE,
            max_steps: DEFAULT_MAX_STEPS,
            initialized: false,
            overflow_count: 0,
        }
    }

    /// Scale applied to every sample when a block is copied out
    pub fn with_output_scale(mut self, scale: f32) -> Self {
        self.output_scale = scale;
        self
    }

    /// Bound the number of generator steps a single pull may run
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Push samples produced outside of a pull (e.g. by an emulator running its own frames)
    ///
    /// If the pending region would exceed its capacity, the backlog is discarded
    /// and accumulation restarts from these samples.
    pub fn feed(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        self.check_overflow();
    }

    /// Number of generated samples waiting to be pulled
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current block size in frames
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Number of times the pending region overflowed and was reset
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Borrow the wrapped generator
    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Mutably borrow the wrapped generator
    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    fn capacity(&self) -> usize {
        self.block_len * PENDING_CAPACITY_BLOCKS
    }

    fn check_overflow(&mut self) {
        let capacity = self.capacity();
        if self.pending.len() > capacity {
            // Pulls are not keeping up; wrap around and keep only the newest partial run.
            let keep = self.pending.len() % capacity;
            let dropped = self.pending.len() - keep;
            self.overflow_count += 1;
            warn!(dropped, capacity, "sample backlog overflowed; resetting accumulator");
            self.pending.drain(..dropped);
        }
    }
}

impl<G: SampleGenerator> SampleSource for ChipSource<G> {
    fn initialize_audio(&mut self, buffer_size_frames: usize, sample_rate_hz: u32) {
        let block_len = quantize_block_size(buffer_size_frames);
        if block_len != buffer_size_frames {
            warn!(
                requested = buffer_size_frames,
                block_len, "buffer size snapped to a supported block size"
            );
        }
        self.block_len = block_len;
        self.block.clear();
        self.block.resize(block_len, 0.0);
        self.pending.clear();
        self.generator.configure(sample_rate_hz);
        self.initialized = true;
        debug!(block_len, sample_rate_hz, "chip source initialized");
    }

    fn sample_buffer(&mut self) -> &[f32] {
        if !self.initialized {
            debug!("sample pull before initialization; returning silence");
            self.block.fill(0.0);
            return &self.block;
        }

        let mut steps = 0;
        while self.pending.len() < self.block_len && steps < self.max_steps {
            self.generator.step(&mut self.pending);
            steps += 1;
        }
        if self.pending.len() < self.block_len {
            warn!(
                available = self.pending.len(),
                wanted = self.block_len,
                steps,
                "generator step limit reached; padding block with silence"
            );
        }

        let available = self.pending.len().min(self.block_len);
        for (dst, src) in self.block.iter_mut().zip(&self.pending[..available]) {
            *dst = *src * self.output_scale;
        }
        self.block[available..].fill(0.0);

        // Shift the remainder back to the front.
        self.pending.drain(..available);

        &self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits a fixed run of ascending values per step
    struct Counter {
        per_step: usize,
        next: f32,
        configured_rate: Option<u32>,
    }

    impl Counter {
        fn new(per_step: usize) -> Self {
            Counter {
                per_step,
                next: 0.0,
                configured_rate: None,
            }
        }
    }

    impl SampleGenerator for Counter {
        fn configure(&mut self, sample_rate_hz: u32) {
            self.configured_rate = Some(sample_rate_hz);
            self.next = 0.0;
        }

        fn step(&mut self, out: &mut Vec<f32>) {
            for _ in 0..self.per_step {
                out.push(self.next);
                self.next += 1.0;
            }
        }
    }

    #[test]
    fn test_initialize_configures_generator() {
        let mut source = ChipSource::new(Counter::new(100));
        source.initialize_audio(1024, 48_000);
        assert_eq!(source.block_len(), 1024);
        assert_eq!(source.generator().configured_rate, Some(48_000));
    }

    #[test]
    fn test_initialize_quantizes_block_size() {
        let mut source = ChipSource::new(Counter::new(100));
        source.initialize_audio(3000, 44_100);
        assert_eq!(source.block_len(), 2048);
        assert_eq!(source.sample_buffer().len(), 2048);
    }

    #[test]
    fn test_pull_steps_until_full_and_keeps_remainder() {
        let mut source = ChipSource::new(Counter::new(300));
        source.initialize_audio(512, 44_100);

        let block = source.sample_buffer().to_vec();
        assert_eq!(block.len(), 512);
        assert_eq!(block[0], 0.0);
        assert_eq!(block[511], 511.0);
        // Two steps produced 600 samples; 88 stay pending.
        assert_eq!(source.pending_len(), 88);

        let block = source.sample_buffer().to_vec();
        assert_eq!(block[0], 512.0, "second block continues where the first ended");
    }

    #[test]
    fn test_output_scale_applied() {
        let mut source = ChipSource::new(Counter::new(512)).with_output_scale(0.5);
        source.initialize_audio(512, 44_100);
        let block = source.sample_buffer();
        assert_eq!(block[10], 5.0);
    }

    #[test]
    fn test_step_limit_pads_with_silence() {
        let mut source = ChipSource::new(Counter::new(100)).with_max_steps(2);
        source.initialize_audio(512, 44_100);
        let block = source.sample_buffer().to_vec();
        assert_eq!(block[199], 199.0);
        assert!(block[200..].iter().all(|&s| s == 0.0));
        assert_eq!(source.pending_len(), 0);
    }

    #[test]
    fn test_uninitialized_pull_is_silent() {
        let mut source = ChipSource::new(Counter::new(100));
        let block = source.sample_buffer();
        assert_eq!(block.len(), 4096);
        assert!(block.iter().all(|&s| s == 0.0));
        assert_eq!(source.generator().configured_rate, None);
    }

    #[test]
    fn test_feed_supplies_samples_without_stepping() {
        let mut source = ChipSource::new(Counter::new(0)).with_max_steps(1);
        source.initialize_audio(512, 44_100);
        source.feed(&vec![0.25; 600]);
        let block = source.sample_buffer().to_vec();
        assert!(block.iter().all(|&s| s == 0.25));
        assert_eq!(source.pending_len(), 88);
    }

    #[test]
    fn test_feed_overflow_resets_backlog() {
        let mut source = ChipSource::new(Counter::new(0));
        source.initialize_audio(512, 44_100);
        source.feed(&vec![0.1; 2048]);
        assert_eq!(source.overflow_count(), 0);

        source.feed(&vec![0.2; 100]);
        assert_eq!(source.overflow_count(), 1);
        assert_eq!(source.pending_len(), 100);
    }
}
