use serde_json::{json, Value};
use vc_core::{
    ExecParams, ModelSlot, PipelineFactory, PitchBuffers, Result, SessionSettings, VcError,
    VoicePipeline,
};
use vc_signal::{FEATURE_SAMPLE_RATE, RVC_HOP_LENGTH};

/// Echoes the newest `return_length` hops of the conversion window at the
/// feature rate. Useful for measuring stream latency without a model.
#[derive(Debug, Default)]
pub struct PassthroughPipeline {
    calls: u64,
}

impl VoicePipeline for PassthroughPipeline {
    fn exec(
        &mut self,
        audio: &[f32],
        _pitch: Option<&mut PitchBuffers>,
        params: &ExecParams,
    ) -> Result<Vec<f32>> {
        self.calls += 1;
        let wanted = params.return_length * RVC_HOP_LENGTH;
        if audio.len() < wanted {
            return Err(VcError::Pipeline(format!(
                "conversion window has {} samples, {wanted} requested",
                audio.len()
            )));
        }
        Ok(audio[audio.len() - wanted..].to_vec())
    }

    fn output_sample_rate(&self) -> u32 {
        FEATURE_SAMPLE_RATE
    }

    fn info(&self) -> Value {
        json!({ "name": "passthrough", "calls": self.calls })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFactory;

impl PipelineFactory for PassthroughFactory {
    fn create(
        &self,
        _slot: &ModelSlot,
        _settings: &SessionSettings,
        _force_reload: bool,
    ) -> Result<Box<dyn VoicePipeline>> {
        Ok(Box::new(PassthroughPipeline::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(return_length: usize) -> ExecParams {
        ExecParams {
            target_id: 0,
            pitch_shift: 0.0,
            formant_shift: 0.0,
            index_ratio: 0.0,
            feature_count: return_length,
            silence_front: 0,
            embedding_layer: 12,
            use_final_proj: false,
            skip_head: 0,
            return_length,
            protect: 0.5,
        }
    }

    #[test]
    fn returns_the_newest_hops() {
        let audio: Vec<f32> = (0..480).map(|i| i as f32).collect();
        let mut pipeline = PassthroughPipeline::default();
        let out = pipeline.exec(&audio, None, &params(2)).unwrap();
        assert_eq!(out.len(), 320);
        assert_eq!(out[0], 160.0);
        assert_eq!(pipeline.output_hop(), RVC_HOP_LENGTH);
    }

    #[test]
    fn short_window_is_an_inference_error() {
        let mut pipeline = PassthroughPipeline::default();
        let err = pipeline.exec(&[0.0; 100], None, &params(1)).unwrap_err();
        assert!(matches!(err, VcError::Pipeline(_)));
    }
}
