use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{error, info, warn};
use vc_core::{
    ChunkHandler, ChunkResponse, ErrorDescriptor, ModelSlot, PipelineFactory, Result,
    SessionSettings, StageTimings, VcError,
};
use vc_signal::rms;

use crate::session::VoiceChangerSession;

const MODEL_SLOT_INDEX_KEY: &str = "modelSlotIndex";

/// Process-wide front door: one lock around the session, the slot list
/// and the persisted settings.
pub struct VoiceChangerManager {
    session: Mutex<VoiceChangerSession>,
    slots: Vec<ModelSlot>,
    store_path: Option<PathBuf>,
}

impl VoiceChangerManager {
    pub fn new(
        settings: SessionSettings,
        factory: Arc<dyn PipelineFactory>,
        slots: Vec<ModelSlot>,
    ) -> Self {
        let initial_slot = settings.model_slot_index;
        let manager = Self {
            session: Mutex::new(VoiceChangerSession::new(settings, factory)),
            slots,
            store_path: None,
        };
        if initial_slot >= 0 {
            if let Err(err) = manager.select_slot(initial_slot) {
                warn!(slot = initial_slot, "initial model slot not loaded: {err}");
            }
        }
        manager
    }

    /// Loads settings from `path` (defaults when missing) and persists every
    /// later change back to it.
    pub fn open(
        path: impl Into<PathBuf>,
        factory: Arc<dyn PipelineFactory>,
        slots: Vec<ModelSlot>,
    ) -> Self {
        let path = path.into();
        let settings = load_settings(&path);
        let mut manager = Self::new(settings, factory, slots);
        manager.store_path = Some(path);
        manager
    }

    fn lock_session(&self) -> MutexGuard<'_, VoiceChangerSession> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("session lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with_session<T>(&self, f: impl FnOnce(&mut VoiceChangerSession) -> T) -> T {
        f(&mut self.lock_session())
    }

    pub fn slots(&self) -> &[ModelSlot] {
        &self.slots
    }

    pub fn settings(&self) -> SessionSettings {
        self.lock_session().settings().clone()
    }

    pub fn select_slot(&self, index: i32) -> Result<()> {
        let mut session = self.lock_session();
        self.select_slot_locked(&mut session, index)
    }

    fn select_slot_locked(&self, session: &mut VoiceChangerSession, index: i32) -> Result<()> {
        if index < 0 {
            session.unload();
            return Ok(());
        }
        let slot = self.find_slot(index)?.clone();
        info!(slot = index, name = %slot.name, "selecting model slot");
        session.select_slot(slot)
    }

    fn find_slot(&self, index: i32) -> Result<&ModelSlot> {
        self.slots
            .iter()
            .find(|s| s.slot_index == index)
            .ok_or_else(|| VcError::Config(format!("model slot {index} does not exist")))
    }

    /// Converts one chunk. Never fails: errors come back as a silent chunk
    /// of the expected length with a descriptor attached.
    pub fn change_voice(&self, chunk: &[f32]) -> ChunkResponse {
        let mut session = self.lock_session();
        if session.settings().pass_through {
            return ChunkResponse {
                audio: chunk.to_vec(),
                volume: rms(chunk),
                timing: StageTimings::new(),
                error: None,
            };
        }

        let output_len = session.output_block_size();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| session.process(chunk)))
            .unwrap_or_else(|payload| Err(VcError::Pipeline(panic_message(payload.as_ref()))));
        match result {
            Ok(out) => ChunkResponse {
                audio: out.audio,
                volume: out.volume,
                timing: out.timing,
                error: None,
            },
            Err(err) => {
                error!(code = err.code().as_str(), "voice conversion failed: {err}");
                ChunkResponse::silent(output_len, Some(ErrorDescriptor::from(&err)))
            }
        }
    }

    /// Applies one setting, persists it and returns the session summary.
    pub fn update_settings(&self, key: &str, value: Value) -> Result<Value> {
        let mut session = self.lock_session();
        if key == MODEL_SLOT_INDEX_KEY {
            let index: i32 = serde_json::from_value(value)
                .map_err(|e| VcError::Config(format!("invalid value for '{key}': {e}")))?;
            let unchanged = index == session.settings().model_slot_index
                && (index < 0 || session.slot().is_some());
            if !unchanged {
                // Slot selection commits the index only once the model loads.
                self.select_slot_locked(&mut session, index)?;
            }
        } else {
            session.apply_setting(key, value)?;
        }
        self.store_locked(&session);
        Ok(session.info())
    }

    pub fn convert(&self, audio: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        self.lock_session().convert(audio, sample_rate)
    }

    pub fn info(&self) -> Value {
        self.lock_session().info()
    }

    pub fn store_settings(&self) -> Result<()> {
        let session = self.lock_session();
        match &self.store_path {
            Some(path) => write_settings(path, session.settings()),
            None => Ok(()),
        }
    }

    fn store_locked(&self, session: &VoiceChangerSession) {
        if let Some(path) = &self.store_path {
            if let Err(err) = write_settings(path, session.settings()) {
                warn!(path = %path.display(), "failed to store settings: {err}");
            }
        }
    }
}

impl ChunkHandler for VoiceChangerManager {
    fn on_audio(&self, chunk: &[f32]) -> ChunkResponse {
        self.change_voice(chunk)
    }

    fn block_size(&self) -> usize {
        self.lock_session().block_size()
    }
}

/// Reads persisted settings. A missing or unreadable store yields defaults.
pub fn load_settings(path: &Path) -> SessionSettings {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            info!(path = %path.display(), "no stored settings, using defaults");
            return SessionSettings::default();
        }
    };
    SessionSettings::from_json(&raw).unwrap_or_else(|err| {
        warn!(path = %path.display(), "ignoring unreadable settings: {err}");
        SessionSettings::default()
    })
}

fn write_settings(path: &Path, settings: &SessionSettings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, settings.to_json()?)?;
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("pipeline panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("pipeline panicked: {msg}")
    } else {
        "pipeline panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::PassthroughFactory;
    use serde_json::json;
    use vc_core::{ErrorCode, ModelFamily};

    fn settings() -> SessionSettings {
        SessionSettings {
            chunk_size: 0.02,
            cross_fade_overlap_size: 0.05,
            extra_convert_size: 0.1,
            ..SessionSettings::default()
        }
    }

    fn slots() -> Vec<ModelSlot> {
        let mut slot = ModelSlot::new(3, ModelFamily::Rvc, 16_000);
        slot.default_tune = 12.0;
        slot.default_protect = 0.33;
        vec![slot]
    }

    #[test]
    fn no_model_yields_tagged_silence() {
        let manager = VoiceChangerManager::new(settings(), Arc::new(PassthroughFactory), slots());
        let response = manager.change_voice(&[0.3; 960]);
        assert_eq!(response.audio, vec![0.0; 960]);
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::NotSelected);
        assert_eq!(error.code.as_str(), "ERR_NOT_SELECTED");
    }

    #[test]
    fn pass_through_returns_input() {
        let manager = VoiceChangerManager::new(settings(), Arc::new(PassthroughFactory), slots());
        manager.update_settings("passThrough", json!(true)).unwrap();
        let chunk: Vec<f32> = (0..960).map(|i| (i as f32 * 0.05).sin()).collect();
        let response = manager.change_voice(&chunk);
        assert_eq!(response.audio, chunk);
        assert!(response.error.is_none());
        assert!(response.volume > 0.5);
    }

    #[test]
    fn selecting_a_slot_applies_its_defaults() {
        let manager = VoiceChangerManager::new(settings(), Arc::new(PassthroughFactory), slots());
        manager.update_settings("modelSlotIndex", json!(3)).unwrap();
        let settings = manager.settings();
        assert_eq!(settings.model_slot_index, 3);
        assert_eq!(settings.tran, 12.0);
        assert_eq!(settings.protect, 0.33);
        assert!(manager.change_voice(&[0.0; 960]).error.is_none());
    }

    #[test]
    fn unknown_slot_is_rejected_before_anything_changes() {
        let manager = VoiceChangerManager::new(settings(), Arc::new(PassthroughFactory), slots());
        let err = manager.update_settings("modelSlotIndex", json!(9)).unwrap_err();
        assert!(matches!(err, VcError::Config(_)));
        assert_eq!(manager.settings().model_slot_index, -1);
    }

    #[test]
    fn failed_slot_switch_keeps_previous_slot_and_settings() {
        let mut slots = slots();
        let mut broken = ModelSlot::new(1, ModelFamily::Rvc, 12_345);
        broken.default_tune = 7.0;
        slots.push(broken);
        let manager = VoiceChangerManager::new(settings(), Arc::new(PassthroughFactory), slots);

        let err = manager.update_settings("modelSlotIndex", json!(1)).unwrap_err();
        assert!(matches!(err, VcError::UnsupportedSampleRate { .. }));
        let unchanged = manager.settings();
        assert_eq!(unchanged.model_slot_index, -1);
        assert_eq!(unchanged.tran, 0.0);
        assert!(manager.with_session(|s| s.slot().is_none()));

        manager.update_settings("modelSlotIndex", json!(3)).unwrap();
        let err = manager.update_settings("modelSlotIndex", json!(1)).unwrap_err();
        assert!(matches!(err, VcError::UnsupportedSampleRate { .. }));
        let kept = manager.settings();
        assert_eq!(kept.model_slot_index, 3);
        assert_eq!(kept.tran, 12.0);
        assert_eq!(manager.with_session(|s| s.slot().map(|slot| slot.slot_index)), Some(3));
        assert!(manager.change_voice(&[0.2; 960]).error.is_none());
    }

    #[test]
    fn negative_slot_unloads() {
        let manager = VoiceChangerManager::new(settings(), Arc::new(PassthroughFactory), slots());
        manager.update_settings("modelSlotIndex", json!(3)).unwrap();
        manager.update_settings("modelSlotIndex", json!(-1)).unwrap();
        assert_eq!(manager.settings().model_slot_index, -1);
        assert_eq!(
            manager.change_voice(&[0.0; 960]).error.unwrap().code,
            ErrorCode::NotSelected
        );
    }

    #[test]
    fn settings_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stored_setting.json");
        {
            let manager =
                VoiceChangerManager::open(&path, Arc::new(PassthroughFactory), slots());
            manager.update_settings("chunkSize", json!(0.05)).unwrap();
            manager.update_settings("modelSlotIndex", json!(3)).unwrap();
        }
        let reopened = VoiceChangerManager::open(&path, Arc::new(PassthroughFactory), slots());
        assert_eq!(reopened.settings().chunk_size, 0.05);
        assert_eq!(reopened.block_size(), 2_400);
        assert!(reopened.with_session(|s| s.slot().is_some()));
    }

    #[test]
    fn unreadable_store_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), SessionSettings::default());
    }
}
