use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{error, info};
use vc_core::{
    ExecParams, ModelFamily, ModelSlot, PipelineFactory, Result, SessionSettings, SettingKey,
    VcError, VoicePipeline, SUPPORTED_SAMPLE_RATES,
};
use vc_signal::{HqResampler, ResampleError, StreamResampler, FEATURE_SAMPLE_RATE, RVC_HOP_LENGTH};

use crate::frames::{DeviceFrames, FrameBuffers, FrameLayout};
use crate::gate::{GateDecision, VolumeGate};

/// Result of one streaming inference step.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    /// Synthesized audio at the output rate, `None` when gated.
    pub audio: Option<Vec<f32>>,
    pub volume: f32,
    pub elapsed: Duration,
}

/// Model adapter chosen once when a slot is loaded.
pub enum VoiceChangerModel {
    Rvc(RvcModel),
}

impl VoiceChangerModel {
    pub fn load(
        slot: ModelSlot,
        settings: &SessionSettings,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<Self> {
        match slot.family {
            ModelFamily::Rvc => Ok(Self::Rvc(RvcModel::new(slot, settings, factory)?)),
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Rvc(_) => ModelFamily::Rvc,
        }
    }

    pub fn slot(&self) -> &ModelSlot {
        match self {
            Self::Rvc(model) => model.slot(),
        }
    }

    pub fn set_slot_info(&mut self, slot: ModelSlot) -> Result<()> {
        match self {
            Self::Rvc(model) => model.set_slot_info(slot),
        }
    }

    pub fn initialize(&mut self, settings: &SessionSettings, force_reload: bool) -> Result<()> {
        match self {
            Self::Rvc(model) => model.initialize(settings, force_reload),
        }
    }

    pub fn set_sampling_rate(&mut self, input_rate: u32, output_rate: u32) -> Result<()> {
        match self {
            Self::Rvc(model) => model.set_sampling_rate(input_rate, output_rate),
        }
    }

    pub fn realloc(&mut self, frames: DeviceFrames, silence_front: bool) {
        match self {
            Self::Rvc(model) => model.realloc(frames, silence_front),
        }
    }

    pub fn update_settings(
        &mut self,
        key: &str,
        value: &Value,
        settings: &SessionSettings,
    ) -> Result<()> {
        match self {
            Self::Rvc(model) => model.update_settings(key, value, settings),
        }
    }

    pub fn inference(
        &mut self,
        chunk: &[f32],
        settings: &SessionSettings,
    ) -> Result<InferenceOutput> {
        match self {
            Self::Rvc(model) => model.inference(chunk, settings),
        }
    }

    pub fn convert(
        &mut self,
        audio: &[f32],
        sample_rate: u32,
        settings: &SessionSettings,
    ) -> Result<Vec<f32>> {
        match self {
            Self::Rvc(model) => model.convert(audio, sample_rate, settings),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        match self {
            Self::Rvc(model) => model.buffers.layout(),
        }
    }

    pub fn info(&self) -> Value {
        match self {
            Self::Rvc(model) => model.info(),
        }
    }
}

/// Streaming adapter for retrieval-based voice conversion models.
///
/// Owns the feature-rate buffers, both resamplers and the gate. The
/// pipeline itself is built by the injected factory.
pub struct RvcModel {
    slot: ModelSlot,
    factory: Arc<dyn PipelineFactory>,
    pipeline: Option<Box<dyn VoicePipeline>>,
    input_rate: u32,
    output_rate: u32,
    inbound: StreamResampler,
    outbound: HqResampler,
    buffers: FrameBuffers,
    gate: VolumeGate,
    scratch: Vec<f32>,
}

impl RvcModel {
    pub fn new(
        slot: ModelSlot,
        settings: &SessionSettings,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<Self> {
        let input_rate = settings.input_sample_rate;
        let output_rate = settings.output_sample_rate;
        let inbound = inbound_resampler(input_rate)?;
        let outbound = outbound_resampler(slot.sampling_rate, output_rate)?;
        info!(
            slot = slot.slot_index,
            model_rate = slot.sampling_rate,
            input_rate,
            output_rate,
            "RVC model adapter created"
        );
        Ok(Self {
            slot,
            factory,
            pipeline: None,
            input_rate,
            output_rate,
            inbound,
            outbound,
            buffers: FrameBuffers::allocate(
                DeviceFrames::from_settings(settings),
                input_rate,
                settings.silence_front,
            ),
            gate: VolumeGate::new(settings.silent_threshold),
            scratch: Vec::new(),
        })
    }

    pub fn slot(&self) -> &ModelSlot {
        &self.slot
    }

    /// Points the adapter at another slot. The old pipeline belongs to the
    /// old slot and is dropped; call [`RvcModel::initialize`] afterwards.
    pub fn set_slot_info(&mut self, slot: ModelSlot) -> Result<()> {
        self.outbound = outbound_resampler(slot.sampling_rate, self.output_rate)?;
        self.pipeline = None;
        self.slot = slot;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Builds the pipeline for the current slot.
    ///
    /// The current pipeline and resampler are replaced only once both new
    /// ones are built, so a failed rebuild keeps streaming on the old ones.
    /// An adapter that never had a pipeline reports `NotInitialized`.
    pub fn initialize(&mut self, settings: &SessionSettings, force_reload: bool) -> Result<()> {
        let pipeline = self
            .factory
            .create(&self.slot, settings, force_reload)
            .inspect_err(|err| error!("failed to create pipeline: {err}"))?;
        let model_rate = pipeline.output_sample_rate();
        let outbound = outbound_resampler(model_rate, self.output_rate)?;
        self.outbound = outbound;
        self.pipeline = Some(pipeline);
        info!(slot = self.slot.slot_index, model_rate, "pipeline initialized");
        Ok(())
    }

    /// Swaps both resamplers, or leaves everything untouched on failure.
    pub fn set_sampling_rate(&mut self, input_rate: u32, output_rate: u32) -> Result<()> {
        let inbound = inbound_resampler(input_rate)?;
        let outbound = outbound_resampler(self.model_rate(), output_rate)?;
        self.inbound = inbound;
        self.outbound = outbound;
        self.input_rate = input_rate;
        self.output_rate = output_rate;
        Ok(())
    }

    pub fn realloc(&mut self, frames: DeviceFrames, silence_front: bool) {
        self.buffers = FrameBuffers::allocate(frames, self.input_rate, silence_front);
        self.inbound.reset();
    }

    pub fn update_settings(
        &mut self,
        key: &str,
        value: &Value,
        settings: &SessionSettings,
    ) -> Result<()> {
        match SettingKey::parse(key) {
            Some(SettingKey::Gpu | SettingKey::ForceFp32) => self.initialize(settings, true),
            Some(SettingKey::SilentThreshold) => {
                self.gate = VolumeGate::new(settings.silent_threshold);
                Ok(())
            }
            Some(SettingKey::F0Detector) | None => match self.pipeline.as_mut() {
                Some(pipeline) => pipeline.update_setting(key, value),
                None => Ok(()),
            },
            Some(_) => Ok(()),
        }
    }

    pub fn inference(
        &mut self,
        chunk: &[f32],
        settings: &SessionSettings,
    ) -> Result<InferenceOutput> {
        let params = self.exec_params(settings);
        let pipeline = self.pipeline.as_mut().ok_or(VcError::NotInitialized)?;

        self.inbound.process(chunk, &mut self.scratch);
        self.buffers.volume.write(&self.scratch);
        let volume = self.gate.measure(&self.buffers.volume);
        let decision = self.gate.decide(volume);
        if decision == GateDecision::Active {
            self.buffers.convert.write(&self.scratch);
        }

        // Pitch state has to advance even while gated.
        let buffers = &mut self.buffers;
        let started = Instant::now();
        let synthesized = pipeline.exec(
            buffers.convert.make_contiguous(),
            Some(&mut buffers.pitch),
            &params,
        )?;
        let elapsed = started.elapsed();

        if decision == GateDecision::Silent {
            return Ok(InferenceOutput {
                audio: None,
                volume,
                elapsed,
            });
        }

        let required = params.return_length * pipeline.output_hop();
        if synthesized.len() < required {
            return Err(VcError::SynthesisTooShort {
                required,
                actual: synthesized.len(),
            });
        }
        Ok(InferenceOutput {
            audio: Some(self.outbound.process(&synthesized)),
            volume,
            elapsed,
        })
    }

    /// Converts a whole clip in one call, without the streaming buffers.
    pub fn convert(
        &mut self,
        audio: &[f32],
        sample_rate: u32,
        settings: &SessionSettings,
    ) -> Result<Vec<f32>> {
        let mut params = self.exec_params(settings);
        let pipeline = self.pipeline.as_mut().ok_or(VcError::NotInitialized)?;

        let to_feature = HqResampler::new(sample_rate, FEATURE_SAMPLE_RATE).map_err(|e| {
            unsupported_rate(sample_rate, e, |rate| {
                HqResampler::new(rate, FEATURE_SAMPLE_RATE).is_ok()
            })
        })?;
        let mut features = to_feature.process(audio);
        let padded = features.len().div_ceil(RVC_HOP_LENGTH) * RVC_HOP_LENGTH;
        features.resize(padded, 0.0);

        let feature_count = padded / RVC_HOP_LENGTH;
        params.feature_count = feature_count;
        params.skip_head = 0;
        params.return_length = feature_count;
        params.silence_front = 0;

        let synthesized = pipeline.exec(&features, None, &params)?;
        let mut out = self.outbound.process(&synthesized);
        let expected = (audio.len() as u64 * self.output_rate as u64 / sample_rate as u64) as usize;
        out.truncate(expected);
        Ok(out)
    }

    pub fn info(&self) -> Value {
        json!({
            "voiceChangerType": self.slot.family.as_str(),
            "slot": self.slot,
            "inputSampleRate": self.input_rate,
            "outputSampleRate": self.output_rate,
            "inboundLatency": self.inbound.latency_frames(),
            "layout": self.buffers.layout(),
            "silentThresholdDb": self.gate.threshold_db(),
            "pipeline": self.pipeline.as_ref().map_or(Value::Null, |p| p.info()),
        })
    }

    fn model_rate(&self) -> u32 {
        self.pipeline
            .as_ref()
            .map_or(self.slot.sampling_rate, |p| p.output_sample_rate())
    }

    fn exec_params(&self, settings: &SessionSettings) -> ExecParams {
        let layout = self.buffers.layout();
        ExecParams {
            target_id: settings.dst_id,
            pitch_shift: settings.tran,
            formant_shift: settings.formant_shift,
            index_ratio: settings.index_ratio,
            feature_count: layout.feature_count,
            silence_front: layout.silence_front,
            embedding_layer: self.slot.emb_output_layer,
            use_final_proj: self.slot.use_final_proj,
            skip_head: layout.skip_head,
            return_length: layout.return_length,
            protect: settings.protect,
        }
    }
}

fn inbound_resampler(input_rate: u32) -> Result<StreamResampler> {
    StreamResampler::new(input_rate, FEATURE_SAMPLE_RATE).map_err(|e| {
        unsupported_rate(input_rate, e, |rate| {
            StreamResampler::new(rate, FEATURE_SAMPLE_RATE).is_ok()
        })
    })
}

fn outbound_resampler(model_rate: u32, output_rate: u32) -> Result<HqResampler> {
    HqResampler::new(model_rate, output_rate).map_err(|e| {
        unsupported_rate(output_rate, e, |rate| HqResampler::new(model_rate, rate).is_ok())
    })
}

/// Lists only the rates for which `builds` succeeds.
fn unsupported_rate(requested: u32, err: ResampleError, builds: impl Fn(u32) -> bool) -> VcError {
    error!("cannot resample at {requested} Hz: {err}");
    VcError::UnsupportedSampleRate {
        requested,
        available: SUPPORTED_SAMPLE_RATES
            .into_iter()
            .filter(|&rate| builds(rate))
            .collect(),
    }
}
