use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VcError>;

#[derive(Debug, Error)]
pub enum VcError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("pipeline error: {0}")]
    Pipeline(String),
    #[error("voice changer is not selected")]
    NotSelected,
    #[error("pipeline is not initialized")]
    NotInitialized,
    #[error("sample rate {requested} Hz is not supported, available rates: {available:?}")]
    UnsupportedSampleRate { requested: u32, available: Vec<u32> },
    #[error("chunk has {actual} samples but the session expects {expected}")]
    ChunkSize { expected: usize, actual: usize },
    #[error("synthesized audio has {actual} samples, at least {required} are required")]
    SynthesisTooShort { required: usize, actual: usize },
    #[error("IO recorder is closed")]
    RecorderClosed,
    #[error("IO recorder error: {0}")]
    Recorder(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotSelected => ErrorCode::NotSelected,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::UnsupportedSampleRate { .. } => ErrorCode::UnsupportedSampleRate,
            _ => ErrorCode::Processing,
        }
    }
}

/// Error class reported to stream clients next to a silent chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotSelected,
    NotInitialized,
    UnsupportedSampleRate,
    Processing,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSelected => "ERR_NOT_SELECTED",
            Self::NotInitialized => "ERR_PIPELINE_NOT_INITIALIZED",
            Self::UnsupportedSampleRate => "ERR_SAMPLE_RATE_NOT_SUPPORTED",
            Self::Processing => "ERR_GENERIC_PROCESSING_ERROR",
        }
    }
}
