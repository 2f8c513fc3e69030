//! Decoding of device lines into samples.
//!
//! A frame is `"<ms>,<value>\n"`, where `<ms>` is the device clock in
//! milliseconds since the stream started and `<value>` the measurement (weight,
//! voltage, ...). A trailing `\r` before the newline is tolerated since the
//! firmware prints with `println`.
//!
//! The protocol has no resync marker. A line that fails to parse is dropped
//! whole and the caller reads the next one.

use std::fmt;

use crate::errors::FrameError;
use crate::protocol::{FIELD_SEPARATOR, LINE_TERMINATOR};

/// One timestamped measurement as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Device clock, milliseconds since stream start.
    pub device_time_ms: u64,
    pub value: f64,
}

impl Sample {
    #[inline]
    pub fn new(device_time_ms: u64, value: f64) -> Self {
        Self {
            device_time_ms,
            value,
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={}ms v={}", self.device_time_ms, self.value)
    }
}

/// Parse one raw device line.
///
/// Returns [`FrameError::Incomplete`] when the line does not end with a newline
/// (the device was mid-write when the read timed out) and
/// [`FrameError::Malformed`] for anything else that is not exactly two numeric
/// fields.
pub fn parse(raw: &[u8]) -> Result<Sample, FrameError> {
    let body = match raw.split_last() {
        Some((&LINE_TERMINATOR, body)) => body,
        _ => return Err(FrameError::Incomplete),
    };
    let body = body.strip_suffix(b"\r").unwrap_or(body);

    let text = std::str::from_utf8(body)
        .map_err(|e| FrameError::Malformed(format!("invalid utf-8: {e}")))?;

    let mut fields = text.split(FIELD_SEPARATOR);
    let (t, v) = match (fields.next(), fields.next(), fields.next()) {
        (Some(t), Some(v), None) => (t.trim(), v.trim()),
        _ => {
            return Err(FrameError::Malformed(format!(
                "expected 2 fields, got {:?}",
                text
            )))
        }
    };

    let device_time_ms = t
        .parse::<u64>()
        .map_err(|_| FrameError::Malformed(format!("bad timestamp {t:?}")))?;
    let value = v
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| FrameError::Malformed(format!("bad value {v:?}")))?;

    Ok(Sample::new(device_time_ms, value))
}
