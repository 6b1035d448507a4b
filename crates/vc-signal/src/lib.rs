pub mod correlation;
pub mod resample;
pub mod ring;

pub use correlation::{best_sola_offset, sola_scores};
pub use resample::{
    HqResampler, PolyphaseKernel, ResampleError, StreamResampler, MAX_RESAMPLE_PHASES,
};
pub use ring::RingBuffer;

/// Rate the feature extractor and pitch estimator run at.
pub const FEATURE_SAMPLE_RATE: u32 = 16_000;
/// One feature frame at [`FEATURE_SAMPLE_RATE`].
pub const RVC_HOP_LENGTH: usize = 160;

/// Root mean square of a block, zero for an empty one.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// dBFS to linear amplitude (`-20 dB -> 0.1`).
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}
