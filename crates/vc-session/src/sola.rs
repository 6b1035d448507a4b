use serde::Serialize;
use tracing::debug;
use vc_core::{Result, VcError};
use vc_signal::best_sola_offset;

/// Output-rate sample counts the crossfader works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SolaFrames {
    pub block: usize,
    pub crossfade: usize,
    pub search: usize,
}

impl SolaFrames {
    /// Shortest synthesized chunk that still covers every possible offset.
    pub fn required_len(&self) -> usize {
        self.search + self.block + self.crossfade
    }
}

/// Complementary raised-sine windows, `fade_in[i] + fade_out[i] == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct FadeWindows {
    pub fade_in: Vec<f32>,
    pub fade_out: Vec<f32>,
}

impl FadeWindows {
    pub fn new(len: usize) -> Self {
        let fade_in: Vec<f32> = (0..len)
            .map(|i| {
                let t = if len > 1 {
                    i as f64 / (len - 1) as f64
                } else {
                    0.0
                };
                let s = (0.5 * std::f64::consts::PI * t).sin();
                (s * s) as f32
            })
            .collect();
        let fade_out = fade_in.iter().map(|w| 1.0 - w).collect();
        Self { fade_in, fade_out }
    }

    pub fn len(&self) -> usize {
        self.fade_in.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fade_in.is_empty()
    }
}

/// Aligns each synthesized chunk against the tail of the previous one and
/// blends them so chunk seams stay continuous.
#[derive(Debug, Clone)]
pub struct SolaCrossfader {
    frames: SolaFrames,
    fades: FadeWindows,
    /// Tail of the previous chunk, `frames.crossfade` samples.
    buffer: Vec<f32>,
    last_offset: usize,
}

impl SolaCrossfader {
    pub fn new(frames: SolaFrames) -> Self {
        debug!(
            block = frames.block,
            crossfade = frames.crossfade,
            search = frames.search,
            "allocated SOLA buffer"
        );
        Self {
            frames,
            fades: FadeWindows::new(frames.crossfade),
            buffer: vec![0.0; frames.crossfade],
            last_offset: 0,
        }
    }

    pub fn frames(&self) -> SolaFrames {
        self.frames
    }

    pub fn fades(&self) -> &FadeWindows {
        &self.fades
    }

    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    pub fn last_offset(&self) -> usize {
        self.last_offset
    }

    /// Regenerates the windows and drops the saved tail.
    pub fn reset(&mut self) {
        *self = Self::new(self.frames);
    }

    /// Switches to new frame counts. The saved tail survives unless the
    /// crossfade length changed.
    pub fn reconfigure(&mut self, frames: SolaFrames) {
        if frames.crossfade != self.frames.crossfade {
            *self = Self::new(frames);
        } else {
            self.frames = frames;
        }
    }

    /// Consumes one synthesized chunk and returns exactly `block` samples.
    pub fn process(&mut self, mut audio: Vec<f32>) -> Result<Vec<f32>> {
        let SolaFrames {
            block,
            crossfade,
            search,
        } = self.frames;
        let required = self.frames.required_len();
        if audio.len() < required {
            return Err(VcError::SynthesisTooShort {
                required,
                actual: audio.len(),
            });
        }

        let offset = best_sola_offset(&audio[..crossfade + search], &self.buffer, search);
        self.last_offset = offset;
        audio.drain(..offset);

        for (i, sample) in audio[..crossfade].iter_mut().enumerate() {
            *sample = *sample * self.fades.fade_in[i] + self.buffer[i] * self.fades.fade_out[i];
        }

        self.buffer.copy_from_slice(&audio[block..block + crossfade]);
        audio.truncate(block);
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, start: usize, period: f32) -> Vec<f32> {
        (start..start + len)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / period).sin() * 0.5)
            .collect()
    }

    #[test]
    fn fades_are_complementary_and_monotonic() {
        let fades = FadeWindows::new(64);
        assert_eq!(fades.fade_in[0], 0.0);
        assert!((fades.fade_in[63] - 1.0).abs() < 1e-6);
        for i in 0..64 {
            assert!((fades.fade_in[i] + fades.fade_out[i] - 1.0).abs() < 1e-6);
        }
        assert!(fades.fade_in.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn returns_exactly_one_block() {
        let frames = SolaFrames {
            block: 100,
            crossfade: 40,
            search: 10,
        };
        let mut sola = SolaCrossfader::new(frames);
        let out = sola.process(vec![0.25; frames.required_len() + 7]).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(sola.buffer(), &[0.25; 40][..]);
    }

    #[test]
    fn short_input_is_rejected() {
        let frames = SolaFrames {
            block: 100,
            crossfade: 40,
            search: 10,
        };
        let mut sola = SolaCrossfader::new(frames);
        let err = sola.process(vec![0.0; 149]).unwrap_err();
        assert!(matches!(
            err,
            VcError::SynthesisTooShort {
                required: 150,
                actual: 149
            }
        ));
    }

    #[test]
    fn silent_history_takes_offset_zero_and_fades_in() {
        let frames = SolaFrames {
            block: 64,
            crossfade: 32,
            search: 8,
        };
        let mut sola = SolaCrossfader::new(frames);
        let out = sola.process(vec![1.0; 104]).unwrap();
        assert_eq!(sola.last_offset(), 0);
        assert_eq!(out[0], 0.0);
        assert!((out[31] - 1.0).abs() < 1e-6);
        assert!(out[32..].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn realigns_a_shifted_continuation() {
        let frames = SolaFrames {
            block: 256,
            crossfade: 128,
            search: 32,
        };
        let mut sola = SolaCrossfader::new(frames);
        let period = 97.0;
        sola.process(sine(frames.required_len(), 0, period)).unwrap();

        // The next chunk starts 11 samples too early.
        let next = sine(frames.required_len(), 256 - 11, period);
        let out = sola.process(next).unwrap();
        assert_eq!(sola.last_offset(), 11);
        let expected = sine(256, 256, period);
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn reconfigure_keeps_tail_only_for_same_crossfade() {
        let frames = SolaFrames {
            block: 50,
            crossfade: 20,
            search: 5,
        };
        let mut sola = SolaCrossfader::new(frames);
        sola.process(vec![0.5; 75]).unwrap();

        sola.reconfigure(SolaFrames { block: 80, ..frames });
        assert_eq!(sola.frames().block, 80);
        assert_eq!(sola.buffer(), &[0.5; 20][..]);

        sola.reconfigure(SolaFrames {
            crossfade: 10,
            ..frames
        });
        assert_eq!(sola.fades().len(), 10);
        assert_eq!(sola.buffer(), &[0.0; 10][..]);
    }
}
