use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ErrorCode, VcError};

/// Wall-clock seconds per processing stage.
pub type StageTimings = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&VcError> for ErrorDescriptor {
    fn from(err: &VcError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// What a transport gets back for every chunk it delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub audio: Vec<f32>,
    pub volume: f32,
    pub timing: StageTimings,
    pub error: Option<ErrorDescriptor>,
}

impl ChunkResponse {
    pub fn silent(len: usize, error: Option<ErrorDescriptor>) -> Self {
        Self {
            audio: vec![0.0; len],
            volume: 0.0,
            timing: StageTimings::new(),
            error,
        }
    }
}

/// Interface the controller exposes to device callbacks and network handlers.
pub trait ChunkHandler: Send + Sync + 'static {
    fn on_audio(&self, chunk: &[f32]) -> ChunkResponse;

    /// Samples per input chunk the handler currently expects.
    fn block_size(&self) -> usize;
}
