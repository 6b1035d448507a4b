#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use vc_core::{
    ExecParams, ModelFamily, ModelSlot, PipelineFactory, PitchBuffers, Result, SessionSettings,
    VcError, VoicePipeline,
};

pub const RATE: u32 = 48_000;

pub fn settings(chunk: f64, crossfade: f64, extra: f64) -> SessionSettings {
    SessionSettings {
        input_sample_rate: RATE,
        output_sample_rate: RATE,
        chunk_size: chunk,
        cross_fade_overlap_size: crossfade,
        extra_convert_size: extra,
        sola_search_size: 0.01,
        ..SessionSettings::default()
    }
}

pub fn slot() -> ModelSlot {
    let mut slot = ModelSlot::new(0, ModelFamily::Rvc, 16_000);
    slot.name = "counting".to_string();
    slot
}

/// `len` samples of a sine starting at absolute sample `start`.
pub fn sine(freq: f32, amplitude: f32, start: usize, len: usize) -> Vec<f32> {
    (start..start + len)
        .map(|i| {
            let t = i as f64 / RATE as f64;
            (amplitude as f64 * (2.0 * std::f64::consts::PI * freq as f64 * t).sin()) as f32
        })
        .collect()
}

/// Largest per-sample change of an `amplitude` sine at `freq` and [`RATE`].
pub fn sine_slope(freq: f32, amplitude: f32) -> f32 {
    amplitude * 2.0 * std::f32::consts::PI * freq / RATE as f32
}

pub fn max_step(samples: &[f32]) -> f32 {
    samples
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .fold(0.0, f32::max)
}

/// Step from the last sample of each chunk to the first of the next.
pub fn seam_steps(chunks: &[Vec<f32>]) -> Vec<f32> {
    chunks
        .windows(2)
        .filter_map(|pair| Some((pair[1].first()? - pair[0].last()?).abs()))
        .collect()
}

pub fn rms(samples: &[f32]) -> f32 {
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len().max(1) as f64).sqrt() as f32
}

/// What the counting pipeline saw, shared with the test body.
#[derive(Debug, Default)]
pub struct Calls {
    pub window_lens: Vec<usize>,
    pub pitch_lens: Vec<usize>,
    /// `pitchf[0]` after each call; the pipeline bumps it by one per call.
    pub pitch_marks: Vec<f32>,
    pub params: Vec<ExecParams>,
    pub updates: Vec<(String, Value)>,
}

/// Echo pipeline that records every call.
pub struct CountingPipeline {
    calls: Arc<Mutex<Calls>>,
    truncate_next: Arc<AtomicBool>,
}

impl VoicePipeline for CountingPipeline {
    fn exec(
        &mut self,
        audio: &[f32],
        pitch: Option<&mut PitchBuffers>,
        params: &ExecParams,
    ) -> Result<Vec<f32>> {
        let mut calls = self.calls.lock().unwrap();
        calls.window_lens.push(audio.len());
        calls.params.push(params.clone());
        if let Some(pitch) = pitch {
            pitch.pitchf[0] += 1.0;
            calls.pitch_lens.push(pitch.len());
            calls.pitch_marks.push(pitch.pitchf[0]);
        }

        let wanted = params.return_length * 160;
        let mut out = audio[audio.len() - wanted..].to_vec();
        if self.truncate_next.swap(false, Ordering::SeqCst) {
            out.truncate(wanted / 2);
        }
        Ok(out)
    }

    fn output_sample_rate(&self) -> u32 {
        16_000
    }

    fn update_setting(&mut self, key: &str, value: &Value) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .updates
            .push((key.to_string(), value.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingFactory {
    pub calls: Arc<Mutex<Calls>>,
    pub truncate_next: Arc<AtomicBool>,
    pub created: AtomicUsize,
    /// Every `create` fails while set.
    pub fail: AtomicBool,
}

impl CountingFactory {
    pub fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl PipelineFactory for CountingFactory {
    fn create(
        &self,
        _slot: &ModelSlot,
        _settings: &SessionSettings,
        _force_reload: bool,
    ) -> Result<Box<dyn VoicePipeline>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(VcError::Pipeline("model file is missing".to_string()));
        }
        Ok(Box::new(CountingPipeline {
            calls: Arc::clone(&self.calls),
            truncate_next: Arc::clone(&self.truncate_next),
        }))
    }
}
