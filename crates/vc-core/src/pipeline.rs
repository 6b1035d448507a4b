use ndarray::Array1;
use serde_json::Value;

use crate::{ModelSlot, Result, SessionSettings};

/// Per-chunk pitch state that survives across chunk boundaries.
///
/// The pipeline shifts and refills these in place; the session only
/// allocates them and hands them over by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PitchBuffers {
    pub pitch: Array1<i64>,
    pub pitchf: Array1<f32>,
}

impl PitchBuffers {
    pub fn zeros(len: usize) -> Self {
        Self {
            pitch: Array1::zeros(len),
            pitchf: Array1::zeros(len),
        }
    }

    pub fn len(&self) -> usize {
        self.pitch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pitch.is_empty()
    }
}

/// Scalar arguments of one pipeline call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecParams {
    pub target_id: i64,
    pub pitch_shift: f32,
    pub formant_shift: f32,
    pub index_ratio: f32,
    pub feature_count: usize,
    pub silence_front: usize,
    pub embedding_layer: u32,
    pub use_final_proj: bool,
    pub skip_head: usize,
    pub return_length: usize,
    pub protect: f32,
}

/// Synchronous inference contract consumed by the session.
///
/// `exec` receives the 16 kHz conversion window and must return
/// `return_length * output_hop()` samples at [`VoicePipeline::output_sample_rate`].
pub trait VoicePipeline: Send {
    fn exec(
        &mut self,
        audio: &[f32],
        pitch: Option<&mut PitchBuffers>,
        params: &ExecParams,
    ) -> Result<Vec<f32>>;

    fn output_sample_rate(&self) -> u32;

    fn output_hop(&self) -> usize {
        (self.output_sample_rate() / 100) as usize
    }

    fn update_setting(&mut self, _key: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> Value {
        Value::Null
    }
}

/// Builds pipelines for a slot. Injected into the session instead of
/// process-wide model registries.
pub trait PipelineFactory: Send + Sync {
    fn create(
        &self,
        slot: &ModelSlot,
        settings: &SessionSettings,
        force_reload: bool,
    ) -> Result<Box<dyn VoicePipeline>>;
}
