//! Windowed-sinc resampling for rational rate pairs.
//!
//! Both resamplers share one [`PolyphaseKernel`]: the reduced ratio `up/down`
//! gives `up` distinct fractional positions, and each gets its own row of
//! Kaiser-windowed sinc taps normalised to unity DC gain.

use thiserror::Error;

/// Largest reduced numerator or denominator accepted for a rate pair.
pub const MAX_RESAMPLE_PHASES: usize = 1_024;

const ZERO_CROSSINGS: usize = 8;
const ROLLOFF: f64 = 0.95;
const KAISER_BETA: f64 = 8.0;
const EDGE_WEIGHT_FLOOR: f32 = 1.0e-3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResampleError {
    #[error("sample rates must be non-zero (got {src} Hz -> {dst} Hz)")]
    ZeroRate { src: u32, dst: u32 },
    #[error("unsupported resampling ratio {src} Hz -> {dst} Hz (reduces to {up}/{down})")]
    UnsupportedRatio {
        src: u32,
        dst: u32,
        up: usize,
        down: usize,
    },
}

#[derive(Debug, Clone)]
pub struct PolyphaseKernel {
    up: usize,
    down: usize,
    half_width: usize,
    /// `up` rows of `2 * half_width` taps, row-major.
    taps: Vec<f32>,
}

impl PolyphaseKernel {
    pub fn new(src_rate: u32, dst_rate: u32) -> Result<Self, ResampleError> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(ResampleError::ZeroRate {
                src: src_rate,
                dst: dst_rate,
            });
        }
        let g = gcd(src_rate, dst_rate);
        let up = (dst_rate / g) as usize;
        let down = (src_rate / g) as usize;
        if up > MAX_RESAMPLE_PHASES || down > MAX_RESAMPLE_PHASES {
            return Err(ResampleError::UnsupportedRatio {
                src: src_rate,
                dst: dst_rate,
                up,
                down,
            });
        }

        // Cutoff in cycles per input sample; below the lower Nyquist.
        let cutoff = 0.5 * ROLLOFF * (up as f64 / down as f64).min(1.0);
        let half_width = (ZERO_CROSSINGS as f64 / (2.0 * cutoff)).ceil() as usize;
        let width = 2 * half_width;
        let window_norm = bessel_i0(KAISER_BETA);

        let mut taps = Vec::with_capacity(up * width);
        let mut row = vec![0.0_f64; width];
        for phase in 0..up {
            let frac = phase as f64 / up as f64;
            for (k, w) in row.iter_mut().enumerate() {
                // Distance from the output instant to input tap `k`.
                let tau = frac + half_width as f64 - 1.0 - k as f64;
                let x = tau / half_width as f64;
                let window = if x.abs() >= 1.0 {
                    0.0
                } else {
                    bessel_i0(KAISER_BETA * (1.0 - x * x).sqrt()) / window_norm
                };
                *w = 2.0 * cutoff * sinc(2.0 * cutoff * tau) * window;
            }
            let sum: f64 = row.iter().sum();
            let scale = if sum.abs() > f64::EPSILON { 1.0 / sum } else { 1.0 };
            taps.extend(row.iter().map(|w| (w * scale) as f32));
        }

        Ok(Self {
            up,
            down,
            half_width,
            taps,
        })
    }

    pub fn ratio(&self) -> (usize, usize) {
        (self.up, self.down)
    }

    /// Taps on each side of the output instant, in input samples.
    pub fn half_width(&self) -> usize {
        self.half_width
    }

    fn width(&self) -> usize {
        2 * self.half_width
    }

    fn row(&self, phase: usize) -> &[f32] {
        let width = self.width();
        &self.taps[phase * width..(phase + 1) * width]
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len * self.up).div_ceil(self.down)
    }
}

/// Stateless resampler: every call treats its input as a standalone window.
///
/// Taps that fall outside the slice are dropped and the remaining weights
/// renormalised, so window edges keep their level instead of tapering.
#[derive(Debug, Clone)]
pub struct HqResampler {
    src_rate: u32,
    dst_rate: u32,
    kernel: Option<PolyphaseKernel>,
}

impl HqResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Result<Self, ResampleError> {
        let kernel = if src_rate == dst_rate && src_rate != 0 {
            None
        } else {
            Some(PolyphaseKernel::new(src_rate, dst_rate)?)
        };
        Ok(Self {
            src_rate,
            dst_rate,
            kernel,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.kernel.is_none()
    }

    pub fn src_rate(&self) -> u32 {
        self.src_rate
    }

    pub fn dst_rate(&self) -> u32 {
        self.dst_rate
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        self.kernel
            .as_ref()
            .map_or(input_len, |k| k.output_len(input_len))
    }

    pub fn process(&self, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        self.process_into(input, &mut out);
        out
    }

    pub fn process_into(&self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        let Some(kernel) = &self.kernel else {
            out.extend_from_slice(input);
            return;
        };
        if input.is_empty() {
            return;
        }

        let len = input.len() as isize;
        let width = kernel.width() as isize;
        let half_width = kernel.half_width as isize;
        let n_out = kernel.output_len(input.len());
        out.reserve(n_out);

        for n in 0..n_out {
            let pos = n * kernel.down;
            let base = (pos / kernel.up) as isize;
            let row = kernel.row(pos % kernel.up);
            let start = base - half_width + 1;
            let end = start + width;
            if start >= 0 && end <= len {
                out.push(dot(row, &input[start as usize..end as usize]));
                continue;
            }

            let mut acc = 0.0_f32;
            let mut weight = 0.0_f32;
            for j in start.max(0)..end.min(len) {
                let w = row[(j - start) as usize];
                acc += w * input[j as usize];
                weight += w;
            }
            out.push(if weight > EDGE_WEIGHT_FLOOR {
                acc / weight
            } else {
                acc
            });
        }
    }
}

/// Resampler for one continuous stream delivered in arbitrary pieces.
///
/// Keeps the last `2 * half_width` input samples, so output is identical no
/// matter how the stream is chunked. Output lags input by `half_width`
/// input samples.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    kernel: Option<PolyphaseKernel>,
    history: Vec<f32>,
    /// Next write slot, which is also the oldest sample.
    hist_pos: usize,
    received: u64,
    /// Position of the next output on the upsampled grid (`n * down`).
    next_pos: u64,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Result<Self, ResampleError> {
        let kernel = if src_rate == dst_rate && src_rate != 0 {
            None
        } else {
            Some(PolyphaseKernel::new(src_rate, dst_rate)?)
        };
        let history = vec![0.0; kernel.as_ref().map_or(0, PolyphaseKernel::width)];
        Ok(Self {
            kernel,
            history,
            hist_pos: 0,
            received: 0,
            next_pos: 0,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.kernel.is_none()
    }

    pub fn latency_frames(&self) -> usize {
        self.kernel.as_ref().map_or(0, PolyphaseKernel::half_width)
    }

    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        let Some(kernel) = &self.kernel else {
            out.extend_from_slice(input);
            return;
        };

        let width = kernel.width();
        let up = kernel.up as u64;
        let down = kernel.down as u64;
        let half_width = kernel.half_width as u64;
        for &x in input {
            self.history[self.hist_pos] = x;
            self.hist_pos = (self.hist_pos + 1) % width;
            self.received += 1;

            while self.next_pos / up + half_width < self.received {
                let row = kernel.row((self.next_pos % up) as usize);
                let (newer, older) = self.history.split_at(self.hist_pos);
                let acc = row
                    .iter()
                    .zip(older.iter().chain(newer.iter()))
                    .map(|(w, s)| w * s)
                    .sum::<f32>();
                out.push(acc);
                self.next_pos += down;
            }
        }
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.hist_pos = 0;
        self.received = 0;
        self.next_pos = 0;
    }
}

fn dot(weights: &[f32], samples: &[f32]) -> f32 {
    weights
        .iter()
        .zip(samples)
        .map(|(w, s)| w * s)
        .sum::<f32>()
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1.0e-9 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0_f64;
    let mut term = 1.0_f64;
    let x2 = x * x * 0.25;
    for k in 1..64 {
        term *= x2 / (k * k) as f64;
        sum += term;
        if term < 1.0e-12 * sum {
            break;
        }
    }
    sum
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}
