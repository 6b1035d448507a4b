pub mod bridge;
pub mod config;
pub mod error;
pub mod pipeline;

pub use bridge::{ChunkHandler, ChunkResponse, ErrorDescriptor, StageTimings};
pub use config::{
    seconds_to_frames, ModelFamily, ModelSlot, SessionSettings, SettingKey,
    SUPPORTED_SAMPLE_RATES,
};
pub use error::{ErrorCode, Result, VcError};
pub use pipeline::{ExecParams, PipelineFactory, PitchBuffers, VoicePipeline};
