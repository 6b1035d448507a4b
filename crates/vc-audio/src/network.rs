//! Message codec for network clients.
//!
//! Clients send `[timestamp_ms, pcm16_bytes]` and get back either a
//! response carrying converted PCM16 audio or an error pair. 16-bit samples
//! halve the bandwidth of a float stream.

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use tracing::warn;
use vc_core::{ChunkHandler, StageTimings};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkReply {
    Response {
        send_timestamp_ms: u64,
        /// Little-endian PCM16.
        audio: Vec<u8>,
        ping_ms: i64,
        volume: f32,
        timing: StageTimings,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Little-endian PCM16 to `[-1, 1)` floats. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32_768.0);
    }
    samples
}

pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let value = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Runs one client message through `handler`.
pub fn handle_request_message<H>(handler: &H, client_timestamp_ms: u64, payload: &[u8]) -> NetworkReply
where
    H: ChunkHandler + ?Sized,
{
    handle_request_at(handler, client_timestamp_ms, now_ms(), payload)
}

fn handle_request_at<H>(
    handler: &H,
    client_timestamp_ms: u64,
    received_ms: u64,
    payload: &[u8],
) -> NetworkReply
where
    H: ChunkHandler + ?Sized,
{
    let input = decode_pcm16(payload);
    let response = handler.on_audio(&input);
    if let Some(err) = response.error {
        warn!(code = err.code.as_str(), "request failed: {}", err.message);
        return NetworkReply::Error {
            code: err.code.as_str().to_string(),
            message: err.message,
        };
    }
    NetworkReply::Response {
        send_timestamp_ms: now_ms(),
        audio: encode_pcm16(&response.audio),
        ping_ms: received_ms as i64 - client_timestamp_ms as i64,
        volume: response.volume,
        timing: response.timing,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
