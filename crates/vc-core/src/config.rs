use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, VcError};

/// Sample rates a session may be configured with.
pub const SUPPORTED_SAMPLE_RATES: [u32; 6] = [16_000, 32_000, 44_100, 48_000, 96_000, 192_000];

/// Describes a model that has already been placed on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSlot {
    pub slot_index: i32,
    pub family: ModelFamily,
    pub name: String,
    pub model_path: String,
    pub index_path: Option<String>,
    /// Rate of the waveform the generator emits.
    pub sampling_rate: u32,
    pub f0: bool,
    pub emb_output_layer: u32,
    pub use_final_proj: bool,
    pub default_tune: f32,
    pub default_index_ratio: f32,
    pub default_protect: f32,
    pub default_formant_shift: f32,
}

impl ModelSlot {
    pub fn new(slot_index: i32, family: ModelFamily, sampling_rate: u32) -> Self {
        Self {
            slot_index,
            family,
            name: String::new(),
            model_path: String::new(),
            index_path: None,
            sampling_rate,
            f0: true,
            emb_output_layer: 12,
            use_final_proj: false,
            default_tune: 0.0,
            default_index_ratio: 0.0,
            default_protect: 0.5,
            default_formant_shift: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "RVC")]
    Rvc,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rvc => "RVC",
        }
    }
}

/// Everything a streaming session can be tuned with at runtime.
///
/// Durations are in seconds and converted to sample counts against the
/// input rate. Field names follow the camelCase keys clients send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub chunk_size: f64,
    pub cross_fade_overlap_size: f64,
    pub extra_convert_size: f64,
    pub sola_search_size: f64,
    /// Gate threshold in dBFS.
    pub silent_threshold: f32,
    pub silence_front: bool,
    pub gpu: i32,
    pub force_fp32: bool,
    pub f0_detector: String,
    pub dst_id: i64,
    pub tran: f32,
    pub formant_shift: f32,
    pub index_ratio: f32,
    pub protect: f32,
    #[serde(rename = "recordIO")]
    pub record_io: bool,
    pub record_dir: String,
    pub pass_through: bool,
    pub model_slot_index: i32,
    pub server_input_audio_gain: f32,
    pub server_output_audio_gain: f32,
    pub server_input_device_name: Option<String>,
    pub server_output_device_name: Option<String>,
    /// Optional second output that plays the converted audio for monitoring.
    pub server_monitor_device_name: Option<String>,
    pub server_monitor_audio_gain: f32,
    /// Keys this crate does not know about; handed to the pipeline as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 48_000,
            output_sample_rate: 48_000,
            chunk_size: 0.1,
            cross_fade_overlap_size: 0.1,
            extra_convert_size: 0.5,
            sola_search_size: 0.01,
            silent_threshold: -60.0,
            silence_front: true,
            gpu: -1,
            force_fp32: false,
            f0_detector: "rmvpe".to_string(),
            dst_id: 0,
            tran: 0.0,
            formant_shift: 0.0,
            index_ratio: 0.0,
            protect: 0.5,
            record_io: false,
            record_dir: "tmp".to_string(),
            pass_through: false,
            model_slot_index: -1,
            server_input_audio_gain: 1.0,
            server_output_audio_gain: 1.0,
            server_input_device_name: None,
            server_output_device_name: None,
            server_monitor_device_name: None,
            server_monitor_audio_gain: 1.0,
            extra: BTreeMap::new(),
        }
    }
}

impl SessionSettings {
    pub fn block_frames(&self) -> usize {
        seconds_to_frames(self.chunk_size, self.input_sample_rate)
    }

    pub fn crossfade_frames(&self) -> usize {
        seconds_to_frames(self.cross_fade_overlap_size, self.input_sample_rate)
    }

    pub fn extra_frames(&self) -> usize {
        seconds_to_frames(self.extra_convert_size, self.input_sample_rate)
    }

    pub fn sola_search_frames(&self) -> usize {
        seconds_to_frames(self.sola_search_size, self.input_sample_rate)
    }

    /// Replaces one property by its wire name and returns the previous value.
    ///
    /// Unknown keys land in [`SessionSettings::extra`]. A value of the wrong
    /// type leaves the settings untouched.
    pub fn set_property(&mut self, key: &str, value: Value) -> Result<Value> {
        let Value::Object(mut map) = serde_json::to_value(&*self)? else {
            return Err(VcError::Config("settings did not serialize to an object".into()));
        };
        let old = map.insert(key.to_string(), value).unwrap_or(Value::Null);
        let updated: SessionSettings = serde_json::from_value(Value::Object(map))
            .map_err(|e| VcError::Config(format!("invalid value for '{key}': {e}")))?;
        *self = updated;
        Ok(old)
    }

    pub fn get_property(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get(key).cloned(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> usize {
    (seconds.max(0.0) * sample_rate as f64).round() as usize
}

/// Settings the session controller reacts to. Anything else is forwarded
/// to the pipeline untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    InputSampleRate,
    OutputSampleRate,
    ChunkSize,
    CrossFadeOverlapSize,
    ExtraConvertSize,
    SolaSearchSize,
    Gpu,
    ForceFp32,
    SilenceFront,
    SilentThreshold,
    RecordIo,
    F0Detector,
}

impl SettingKey {
    pub const ALL: [SettingKey; 12] = [
        Self::InputSampleRate,
        Self::OutputSampleRate,
        Self::ChunkSize,
        Self::CrossFadeOverlapSize,
        Self::ExtraConvertSize,
        Self::SolaSearchSize,
        Self::Gpu,
        Self::ForceFp32,
        Self::SilenceFront,
        Self::SilentThreshold,
        Self::RecordIo,
        Self::F0Detector,
    ];

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputSampleRate => "inputSampleRate",
            Self::OutputSampleRate => "outputSampleRate",
            Self::ChunkSize => "chunkSize",
            Self::CrossFadeOverlapSize => "crossFadeOverlapSize",
            Self::ExtraConvertSize => "extraConvertSize",
            Self::SolaSearchSize => "solaSearchSize",
            Self::Gpu => "gpu",
            Self::ForceFp32 => "forceFp32",
            Self::SilenceFront => "silenceFront",
            Self::SilentThreshold => "silentThreshold",
            Self::RecordIo => "recordIO",
            Self::F0Detector => "f0Detector",
        }
    }

    /// Whether the frame buffers have to be rebuilt after this key changes.
    pub fn requires_realloc(self) -> bool {
        matches!(
            self,
            Self::InputSampleRate
                | Self::ChunkSize
                | Self::CrossFadeOverlapSize
                | Self::ExtraConvertSize
                | Self::SolaSearchSize
                | Self::Gpu
                | Self::ForceFp32
                | Self::SilenceFront
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_follow_input_rate() {
        let mut settings = SessionSettings {
            chunk_size: 0.02,
            cross_fade_overlap_size: 0.2,
            ..SessionSettings::default()
        };
        assert_eq!(settings.block_frames(), 960);
        assert_eq!(settings.crossfade_frames(), 9_600);
        assert_eq!(settings.sola_search_frames(), 480);

        settings.input_sample_rate = 44_100;
        assert_eq!(settings.block_frames(), 882);
        assert_eq!(settings.sola_search_frames(), 441);
    }

    #[test]
    fn set_property_returns_previous_value() {
        let mut settings = SessionSettings::default();
        let old = settings
            .set_property("crossFadeOverlapSize", json!(0.2))
            .unwrap();
        assert_eq!(old, json!(0.1));
        assert_eq!(settings.cross_fade_overlap_size, 0.2);
    }

    #[test]
    fn set_property_rejects_wrong_type() {
        let mut settings = SessionSettings::default();
        let err = settings
            .set_property("inputSampleRate", json!("fast"))
            .unwrap_err();
        assert!(matches!(err, VcError::Config(_)));
        assert_eq!(settings.input_sample_rate, 48_000);
    }

    #[test]
    fn unknown_keys_are_kept_for_the_pipeline() {
        let mut settings = SessionSettings::default();
        let old = settings.set_property("rvcQuality", json!(1)).unwrap();
        assert_eq!(old, Value::Null);
        assert_eq!(settings.extra.get("rvcQuality"), Some(&json!(1)));
        assert_eq!(settings.get_property("rvcQuality"), Some(json!(1)));
    }

    #[test]
    fn settings_round_trip_through_json() {
        let mut settings = SessionSettings::default();
        settings.record_io = true;
        settings.server_input_device_name = Some("Mic".into());
        let raw = settings.to_json().unwrap();
        assert!(raw.contains("\"recordIO\": true"));
        assert_eq!(SessionSettings::from_json(&raw).unwrap(), settings);
    }

    #[test]
    fn setting_keys_parse_from_wire_names() {
        for key in SettingKey::ALL {
            assert_eq!(SettingKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(SettingKey::parse("tran"), None);
    }
}
