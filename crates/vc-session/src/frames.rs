use serde::Serialize;
use tracing::info;
use vc_core::{PitchBuffers, SessionSettings};
use vc_signal::{RingBuffer, FEATURE_SAMPLE_RATE, RVC_HOP_LENGTH};

/// Leading context kept when the start of the window is known to be silence.
const SILENCE_FRONT_KEEP_HOPS: usize = 5;

/// Timing parameters as sample counts at the input device rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceFrames {
    pub block: usize,
    pub extra: usize,
    pub crossfade: usize,
    pub sola_search: usize,
}

impl DeviceFrames {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            block: settings.block_frames(),
            extra: settings.extra_frames(),
            crossfade: settings.crossfade_frames(),
            sola_search: settings.sola_search_frames(),
        }
    }
}

/// Buffer sizes and trim parameters at the feature rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLayout {
    pub block: usize,
    pub extra: usize,
    pub crossfade: usize,
    pub sola_search: usize,
    /// Conversion window, a multiple of the hop.
    pub convert_size: usize,
    pub feature_count: usize,
    pub skip_head: usize,
    pub return_length: usize,
    pub silence_front: usize,
    pub volume_size: usize,
}

impl FrameLayout {
    pub fn compute(frames: DeviceFrames, input_rate: u32, silence_front: bool) -> Self {
        let hop = RVC_HOP_LENGTH;
        let block = to_feature_rate(frames.block, input_rate);
        let extra = to_feature_rate(frames.extra, input_rate);
        let crossfade = to_feature_rate(frames.crossfade, input_rate);
        let sola_search = to_feature_rate(frames.sola_search, input_rate);

        // The model drops a trailing partial hop, so pad the window up to a whole one.
        let convert_size = (block + sola_search + extra + crossfade).div_ceil(hop) * hop;
        let feature_count = convert_size / hop;
        let skip_head = extra / hop;

        Self {
            block,
            extra,
            crossfade,
            sola_search,
            convert_size,
            feature_count,
            skip_head,
            return_length: feature_count - skip_head,
            silence_front: if silence_front {
                extra.saturating_sub(hop * SILENCE_FRONT_KEEP_HOPS)
            } else {
                0
            },
            volume_size: block + crossfade,
        }
    }
}

/// Every buffer whose size depends on the timing parameters.
///
/// Always built as a unit; replacing it discards the buffered history.
#[derive(Debug, Clone)]
pub struct FrameBuffers {
    layout: FrameLayout,
    pub convert: RingBuffer,
    pub volume: RingBuffer,
    pub pitch: PitchBuffers,
}

impl FrameBuffers {
    pub fn allocate(frames: DeviceFrames, input_rate: u32, silence_front: bool) -> Self {
        let layout = FrameLayout::compute(frames, input_rate, silence_front);
        // One extra slot: some pitch estimators emit an additional frame.
        let pitch_len = layout.feature_count + 1;
        info!(
            volume = layout.volume_size,
            convert = layout.convert_size,
            pitch = pitch_len,
            skip_head = layout.skip_head,
            return_length = layout.return_length,
            "allocated frame buffers"
        );
        Self {
            layout,
            convert: RingBuffer::zeros(layout.convert_size),
            volume: RingBuffer::zeros(layout.volume_size),
            pitch: PitchBuffers::zeros(pitch_len),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }
}

fn to_feature_rate(samples: usize, input_rate: u32) -> usize {
    if input_rate == 0 {
        return 0;
    }
    ((samples as u64) * FEATURE_SAMPLE_RATE as u64).div_ceil(input_rate as u64) as usize
}
