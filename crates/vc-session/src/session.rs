use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use vc_core::{
    ModelSlot, PipelineFactory, Result, SessionSettings, SettingKey, StageTimings, VcError,
};

use crate::frames::{DeviceFrames, FrameLayout};
use crate::model::VoiceChangerModel;
use crate::recorder::IoRecorder;
use crate::sola::{SolaCrossfader, SolaFrames};

const RECORD_DIR_KEY: &str = "recordDir";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No model selected; chunks are rejected.
    Unloaded,
    Ready,
    Streaming,
    Reconfiguring,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub audio: Vec<f32>,
    pub volume: f32,
    pub timing: StageTimings,
}

/// Streaming session controller.
///
/// Owns the settings, the selected model adapter, the SOLA state and the
/// recorder. Not internally synchronized; callers share it behind one lock.
pub struct VoiceChangerSession {
    settings: SessionSettings,
    factory: Arc<dyn PipelineFactory>,
    state: SessionState,
    frames: DeviceFrames,
    model: Option<VoiceChangerModel>,
    sola: SolaCrossfader,
    recorder: IoRecorder,
    /// Set when the last open failed; cleared by the next explicit open.
    recorder_failed: bool,
}

impl VoiceChangerSession {
    pub fn new(settings: SessionSettings, factory: Arc<dyn PipelineFactory>) -> Self {
        let frames = DeviceFrames::from_settings(&settings);
        let sola = SolaCrossfader::new(sola_frames(&settings, frames));
        let recorder = IoRecorder::new(settings.record_dir.clone());
        Self {
            settings,
            factory,
            state: SessionState::Unloaded,
            frames,
            model: None,
            sola,
            recorder,
            recorder_failed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn frames(&self) -> DeviceFrames {
        self.frames
    }

    pub fn sola(&self) -> &SolaCrossfader {
        &self.sola
    }

    /// Feature-rate layout of the loaded model, if any.
    pub fn layout(&self) -> Option<FrameLayout> {
        self.model.as_ref().map(|m| *m.layout())
    }

    pub fn slot(&self) -> Option<&ModelSlot> {
        self.model.as_ref().map(VoiceChangerModel::slot)
    }

    /// Input samples expected per chunk.
    pub fn block_size(&self) -> usize {
        self.frames.block
    }

    /// Output samples produced per chunk.
    pub fn output_block_size(&self) -> usize {
        self.sola.frames().block
    }

    /// Loads the slot, then applies its default voice parameters.
    /// Settings are left alone when loading fails.
    pub fn select_slot(&mut self, slot: ModelSlot) -> Result<()> {
        let defaults = slot.clone();
        self.load_model(slot)?;
        self.settings.model_slot_index = defaults.slot_index;
        self.settings.tran = defaults.default_tune;
        self.settings.index_ratio = defaults.default_index_ratio;
        self.settings.protect = defaults.default_protect;
        self.settings.formant_shift = defaults.default_formant_shift;
        Ok(())
    }

    /// Selects the adapter for `slot.family` and rebuilds every buffer.
    ///
    /// An adapter of the same family is kept and only pointed at the new
    /// slot. A pipeline that fails to build is logged; the session is still
    /// `Ready` and reports `NotInitialized` per chunk.
    pub fn load_model(&mut self, slot: ModelSlot) -> Result<()> {
        info!(
            slot = slot.slot_index,
            family = slot.family.as_str(),
            "loading model"
        );
        let frames = DeviceFrames::from_settings(&self.settings);
        let previous_state = self.state;
        self.state = SessionState::Reconfiguring;

        let model = match self.model.take() {
            Some(mut model) if model.family() == slot.family => {
                if let Err(err) = model.set_slot_info(slot) {
                    self.model = Some(model);
                    self.state = previous_state;
                    return Err(err);
                }
                model.realloc(frames, self.settings.silence_front);
                model
            }
            previous => {
                match VoiceChangerModel::load(slot, &self.settings, Arc::clone(&self.factory)) {
                    Ok(model) => model,
                    Err(err) => {
                        self.model = previous;
                        self.state = previous_state;
                        return Err(err);
                    }
                }
            }
        };
        let model = self.model.insert(model);
        if let Err(err) = model.initialize(&self.settings, false) {
            error!(slot = model.slot().slot_index, "pipeline is not available: {err}");
        }

        self.frames = frames;
        self.sola = SolaCrossfader::new(sola_frames(&self.settings, frames));
        if self.settings.record_io {
            self.open_recorder();
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            info!("model unloaded");
        }
        self.settings.model_slot_index = -1;
        self.recorder.close();
        self.state = SessionState::Unloaded;
    }

    /// Sets one property by wire name and reconfigures for it.
    ///
    /// Returns `false` when the value did not change. A failed
    /// reconfiguration restores the previous settings.
    pub fn apply_setting(&mut self, key: &str, value: Value) -> Result<bool> {
        let previous = self.settings.clone();
        let old = self.settings.set_property(key, value)?;
        let new = self.settings.get_property(key).unwrap_or(Value::Null);
        if new == old {
            return Ok(false);
        }
        if let Err(err) = self.update_settings(key, &new, &old) {
            warn!(key, "reverting setting: {err}");
            self.settings = previous;
            return Err(err);
        }
        Ok(true)
    }

    /// Reacts to a setting that has already been stored.
    pub fn update_settings(&mut self, key: &str, new: &Value, old: &Value) -> Result<()> {
        debug!(key, %new, %old, "setting changed");
        if self.model.is_none() {
            warn!(key, "voice changer is not selected, only the stored value changes");
            self.refresh_frames(SettingKey::parse(key));
            self.sync_recorder(key);
            return Ok(());
        }

        self.state = SessionState::Reconfiguring;
        let result = self.reconfigure(key, new);
        self.state = SessionState::Ready;
        result
    }

    fn reconfigure(&mut self, key: &str, value: &Value) -> Result<()> {
        let parsed = SettingKey::parse(key);
        if let Some(model) = self.model.as_mut() {
            // Fallible steps run before anything is reallocated.
            if matches!(
                parsed,
                Some(SettingKey::InputSampleRate | SettingKey::OutputSampleRate)
            ) {
                model.set_sampling_rate(
                    self.settings.input_sample_rate,
                    self.settings.output_sample_rate,
                )?;
            }
            model.update_settings(key, value, &self.settings)?;
            if parsed.is_some_and(SettingKey::requires_realloc) {
                model.realloc(
                    DeviceFrames::from_settings(&self.settings),
                    self.settings.silence_front,
                );
            }
        }
        self.refresh_frames(parsed);
        self.sync_recorder(key);
        Ok(())
    }

    fn refresh_frames(&mut self, key: Option<SettingKey>) {
        self.frames = DeviceFrames::from_settings(&self.settings);
        let frames = sola_frames(&self.settings, self.frames);
        match key {
            Some(SettingKey::Gpu | SettingKey::InputSampleRate | SettingKey::OutputSampleRate) => {
                self.sola = SolaCrossfader::new(frames);
            }
            _ => self.sola.reconfigure(frames),
        }
    }

    fn sync_recorder(&mut self, key: &str) {
        let rate_changed = matches!(
            SettingKey::parse(key),
            Some(SettingKey::InputSampleRate | SettingKey::OutputSampleRate)
        );
        if key == RECORD_DIR_KEY {
            self.recorder = IoRecorder::new(self.settings.record_dir.clone());
        }
        if !(rate_changed || key == RECORD_DIR_KEY || key == SettingKey::RecordIo.as_str()) {
            return;
        }
        if self.settings.record_io {
            self.open_recorder();
        } else {
            self.recorder_failed = false;
            self.recorder.close();
        }
    }

    fn open_recorder(&mut self) {
        let result = self
            .recorder
            .open(self.settings.input_sample_rate, self.settings.output_sample_rate);
        self.recorder_failed = result.is_err();
        if let Err(err) = result {
            warn!(dir = %self.settings.record_dir, "failed to open IO recorder: {err}");
        }
    }

    /// Runs one chunk through gate, pipeline and SOLA.
    pub fn process(&mut self, chunk: &[f32]) -> Result<ProcessOutput> {
        let started = Instant::now();
        let model = self.model.as_mut().ok_or(VcError::NotSelected)?;
        if chunk.len() != self.frames.block {
            return Err(VcError::ChunkSize {
                expected: self.frames.block,
                actual: chunk.len(),
            });
        }

        let inference = model.inference(chunk, &self.settings)?;
        let audio = match inference.audio {
            Some(audio) => self.sola.process(audio)?,
            None => vec![0.0; self.sola.frames().block],
        };
        self.state = SessionState::Streaming;

        if self.settings.record_io {
            self.record(chunk, &audio);
        }

        let mut timing = StageTimings::new();
        timing.insert("inference".to_string(), inference.elapsed.as_secs_f64());
        timing.insert("main-process".to_string(), started.elapsed().as_secs_f64());
        Ok(ProcessOutput {
            audio,
            volume: inference.volume,
            timing,
        })
    }

    /// A recorder that failed to open stays closed until the next
    /// `recordIO`, `recordDir` or rate change.
    fn record(&mut self, input: &[f32], output: &[f32]) {
        if self.recorder_failed {
            return;
        }
        if !self.recorder.is_open() {
            self.open_recorder();
        }
        let result = self
            .recorder
            .write_input(input)
            .and_then(|()| self.recorder.write_output(output));
        if let Err(err) = result {
            warn!("failed to record chunk: {err}");
        }
    }

    /// Converts a whole clip at `sample_rate`, returning output-rate audio.
    pub fn convert(&mut self, audio: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let model = self.model.as_mut().ok_or(VcError::NotSelected)?;
        model.convert(audio, sample_rate, &self.settings)
    }

    pub fn info(&self) -> Value {
        json!({
            "state": self.state,
            "settings": self.settings,
            "deviceFrames": self.frames,
            "sola": self.sola.frames(),
            "recording": self.recorder.is_open(),
            "model": self.model.as_ref().map_or(Value::Null, VoiceChangerModel::info),
        })
    }
}

/// SOLA frame counts at the output rate for device-rate `frames`.
fn sola_frames(settings: &SessionSettings, frames: DeviceFrames) -> SolaFrames {
    let input_rate = settings.input_sample_rate.max(1) as u64;
    let output_rate = settings.output_sample_rate as u64;
    let to_output = |n: usize| (n as u64 * output_rate / input_rate) as usize;
    SolaFrames {
        block: to_output(frames.block),
        crossfade: to_output(frames.crossfade),
        search: to_output(frames.sola_search),
    }
}
