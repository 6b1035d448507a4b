//! Streaming session controller.
//!
//! Turns a stream of fixed-size device chunks into same-length converted
//! chunks: the frame buffers feed a [`vc_core::VoicePipeline`] at 16 kHz,
//! the gate skips silent input and [`SolaCrossfader`] keeps chunk seams
//! continuous. [`VoiceChangerManager`] is the thread-safe front door used by
//! device and network bridges.

pub mod frames;
pub mod gate;
pub mod manager;
pub mod model;
pub mod passthrough;
pub mod recorder;
pub mod session;
pub mod sola;

pub use frames::{DeviceFrames, FrameBuffers, FrameLayout};
pub use gate::{GateDecision, VolumeGate};
pub use manager::{load_settings, VoiceChangerManager};
pub use model::{InferenceOutput, RvcModel, VoiceChangerModel};
pub use passthrough::{PassthroughFactory, PassthroughPipeline};
pub use recorder::{IoRecorder, INPUT_FILE_NAME, OUTPUT_FILE_NAME};
pub use session::{ProcessOutput, SessionState, VoiceChangerSession};
pub use sola::{FadeWindows, SolaCrossfader, SolaFrames};
