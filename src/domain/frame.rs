//! Telemetry Frame Decoding
//!
//! The joystick firmware notifies one JSON object per reading:
//!
//! ```text
//! {"Ax": 0.42, "Ay": -0.10}\n
//! ```
//!
//! - `Ax`: horizontal deflection, nominally -1.0..=1.0 (defaults to 0.0)
//! - `Ay`: vertical deflection, nominally -1.0..=1.0 (defaults to 0.0)
//! - `\n`: optional delimiter, present when the transport may split a
//!   reading across several notifications
//!
//! Unknown fields are ignored. Out-of-range values are passed through.

use crate::domain::models::ControlValue;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Terminates a logical frame when reassembly is enabled
pub const FRAME_DELIMITER: u8 = b'\n';

/// Upper bound on bytes buffered while waiting for a delimiter
pub const MAX_PENDING_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Deserialize)]
struct TelemetryFrame {
    #[serde(rename = "Ax", default)]
    ax: f32,
    #[serde(rename = "Ay", default)]
    ay: f32,
}

/// Decode one telemetry frame into a control value
pub fn decode(frame: &[u8]) -> Result<ControlValue, DecodeError> {
    let text = std::str::from_utf8(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    // Structs also deserialize from arrays, so reject anything but an object first
    if !value.is_object() {
        return Err(DecodeError::InvalidJson(format!(
            "expected an object, found {}",
            json_kind(&value)
        )));
    }

    let telemetry =
        TelemetryFrame::deserialize(value).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    Ok(ControlValue::new(telemetry.ax, telemetry.ay))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Per-device byte accumulator for fragmented notifications.
///
/// Bytes are buffered until a [`FRAME_DELIMITER`] arrives; each complete
/// segment is returned once and the trailing partial segment is carried
/// into the next [`FrameAssembler::push`].
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_pending: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(MAX_PENDING_BYTES)
    }
}

impl FrameAssembler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_pending,
        }
    }

    /// Append a notification and return every segment it completed.
    ///
    /// Blank segments (e.g. from `\r\n` line endings or repeated
    /// delimiters) are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut segments = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == FRAME_DELIMITER) {
            let mut segment: Vec<u8> = self.buffer.drain(..=end).collect();
            segment.pop();
            if !segment.iter().all(u8::is_ascii_whitespace) {
                segments.push(segment);
            }
        }

        if self.buffer.len() > self.max_pending {
            warn!(
                "Discarding {} buffered bytes without a frame delimiter",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        segments
    }

    /// Forget any partial segment (e.g. after the link was re-established)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
