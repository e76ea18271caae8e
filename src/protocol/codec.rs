use std::io::{Read, Write};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::{Frame, MSG_BATCH};
use crate::error::GatewayError;

/// First byte of every compressed binary frame. Anything else on the binary
/// path is rejected; text frames are plain UTF-8 JSON.
pub const GZIP_MAGIC: u8 = 0x01;

// ============================================================================
// Wire messages
// ============================================================================

/// Transport-level message handed to a connection's socket task.
///
/// The delivery pipeline produces these; the WebSocket send task maps them to
/// axum `Message`s. Keeping the pipeline off the axum types lets tests capture
/// output with a plain mpsc channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

// ============================================================================
// Compression settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// flate2 compression level, 0–9.
    pub level: u32,
    /// Serialized batches at or below this many bytes are sent as text.
    pub threshold: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
            threshold: 1024,
        }
    }
}

// ============================================================================
// Batch envelope
// ============================================================================

/// Wrap an ordered list of frames as a single `batch` frame.
pub fn batch_frame(frames: Vec<Frame>) -> Frame {
    let count = frames.len();
    Frame::new(
        MSG_BATCH,
        json!({
            "messages": frames,
            "count": count,
            "timestamp": Utc::now().timestamp_millis(),
        }),
    )
}

// ============================================================================
// Encode / decode
// ============================================================================

/// Serialize a frame for the wire, compressing to the `[0x01][gzip]` binary
/// form when compression is enabled and the text exceeds the threshold.
pub fn encode(frame: &Frame, compression: &CompressionSettings) -> Result<WireMessage, GatewayError> {
    let text = serde_json::to_string(frame)
        .map_err(|e| GatewayError::Delivery(format!("frame serialization failed: {e}")))?;

    if compression.enabled && text.len() > compression.threshold {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(text.len() / 2 + 1),
            Compression::new(compression.level.min(9)),
        );
        encoder
            .write_all(text.as_bytes())
            .and_then(|_| encoder.finish())
            .map(|compressed| {
                let mut bytes = Vec::with_capacity(compressed.len() + 1);
                bytes.push(GZIP_MAGIC);
                bytes.extend_from_slice(&compressed);
                WireMessage::Binary(bytes)
            })
            .map_err(|e| GatewayError::Delivery(format!("gzip failed: {e}")))
    } else {
        Ok(WireMessage::Text(text))
    }
}

/// Serialize a frame as plain text, never compressing. Used for the
/// realtime-critical bypass path.
pub fn encode_text(frame: &Frame) -> Result<WireMessage, GatewayError> {
    serde_json::to_string(frame)
        .map(WireMessage::Text)
        .map_err(|e| GatewayError::Delivery(format!("frame serialization failed: {e}")))
}

/// Parse an inbound text frame.
pub fn decode_text(text: &str) -> Result<Frame, GatewayError> {
    serde_json::from_str(text).map_err(|_| GatewayError::InvalidMessageFormat)
}

/// Parse an inbound binary frame: a `0x01` prefix means gzipped UTF-8 JSON,
/// anything else is treated as raw UTF-8.
pub fn decode_binary(bytes: &[u8]) -> Result<Frame, GatewayError> {
    match bytes.first() {
        Some(&GZIP_MAGIC) => {
            let mut decoder = GzDecoder::new(&bytes[1..]);
            let mut text = String::new();
            decoder
                .read_to_string(&mut text)
                .map_err(|_| GatewayError::InvalidMessageFormat)?;
            decode_text(&text)
        }
        _ => {
            let text =
                std::str::from_utf8(bytes).map_err(|_| GatewayError::InvalidMessageFormat)?;
            decode_text(text)
        }
    }
}

// ============================================================================
// Content hashing (deduplication)
// ============================================================================

/// SHA-256 over the frame type and its canonicalized payload.
///
/// Canonicalization sorts object keys recursively so two payloads that differ
/// only in key order hash identically.
pub fn content_hash(frame: &Frame) -> String {
    let canonical = canonicalize(&frame.payload);
    let mut hasher = Sha256::new();
    hasher.update(frame.kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
