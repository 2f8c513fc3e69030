//! Command encoding for the acquisition firmware.
//!
//! Every command is a single code byte. `SetStreamDelay` is followed by the delay
//! in milliseconds as ASCII digits and a terminating `x`:
//!
//! ```text
//! 0x04 '2' '5' '0' 'x'     -> stream one frame every 250 ms
//! ```
//!
//! The device answers with newline-terminated ASCII lines; see [`crate::frame`].

use std::fmt;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate the firmware is built for.
pub const BAUD_RATE: u32 = 115200;

/// Terminator byte closing the `SetStreamDelay` payload.
pub const DELAY_TERMINATOR: u8 = b'x';

/// Terminator of every device line.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Separator between the timestamp and value fields of a frame.
pub const FIELD_SEPARATOR: char = ',';

// ============================================================================
// Command codes
// ============================================================================

/// Command bytes understood by the firmware. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    Handshake = 0,
    ValueRequest = 1,
    StopStream = 2,
    StartStream = 3,
    SetStreamDelay = 4,
    Tare = 5,
}

impl CommandCode {
    pub const ALL: [CommandCode; 6] = [
        CommandCode::Handshake,
        CommandCode::ValueRequest,
        CommandCode::StopStream,
        CommandCode::StartStream,
        CommandCode::SetStreamDelay,
        CommandCode::Tare,
    ];

    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.byte() == byte)
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.byte())
    }
}

/// Delay between streamed frames, in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamDelay(u32);

impl StreamDelay {
    pub const fn from_millis(ms: u32) -> Self {
        StreamDelay(ms)
    }

    pub const fn as_millis(self) -> u32 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(u64::from(self.0))
    }
}

impl fmt::Display for StreamDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A complete command, payload included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Handshake,
    ValueRequest,
    StopStream,
    StartStream,
    SetStreamDelay(StreamDelay),
    Tare,
}

impl Command {
    pub fn code(self) -> CommandCode {
        match self {
            Command::Handshake => CommandCode::Handshake,
            Command::ValueRequest => CommandCode::ValueRequest,
            Command::StopStream => CommandCode::StopStream,
            Command::StartStream => CommandCode::StartStream,
            Command::SetStreamDelay(_) => CommandCode::SetStreamDelay,
            Command::Tare => CommandCode::Tare,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(self) -> Vec<u8> {
        let mut out = vec![self.code().byte()];
        if let Command::SetStreamDelay(delay) = self {
            out.extend_from_slice(delay.as_millis().to_string().as_bytes());
            out.push(DELAY_TERMINATOR);
        }
        out
    }
}

/// Encode a payload-free command code. `SetStreamDelay` needs a delay and goes
/// through [`Command::SetStreamDelay`].
pub fn encode_code(code: CommandCode) -> Vec<u8> {
    vec![code.byte()]
}

/// Recover the delay from an encoded `SetStreamDelay` command.
pub fn decode_delay_payload(bytes: &[u8]) -> Option<StreamDelay> {
    let (&code, rest) = bytes.split_first()?;
    if code != CommandCode::SetStreamDelay.byte() {
        return None;
    }
    let (&term, digits) = rest.split_last()?;
    if term != DELAY_TERMINATOR || digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits)
        .ok()?
        .parse::<u32>()
        .ok()
        .map(StreamDelay::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_fixed() {
        assert_eq!(Command::Handshake.encode(), vec![0]);
        assert_eq!(Command::ValueRequest.encode(), vec![1]);
        assert_eq!(Command::StopStream.encode(), vec![2]);
        assert_eq!(Command::StartStream.encode(), vec![3]);
        assert_eq!(Command::Tare.encode(), vec![5]);
        assert_eq!(encode_code(CommandCode::SetStreamDelay), vec![4]);
    }

    #[test]
    fn set_stream_delay_payload() {
        let bytes = Command::SetStreamDelay(StreamDelay::from_millis(100)).encode();
        assert_eq!(bytes, b"\x04100x".to_vec());

        let zero = Command::SetStreamDelay(StreamDelay::from_millis(0)).encode();
        assert_eq!(zero, b"\x040x".to_vec());
    }

    #[test]
    fn delay_payload_recovers_value() {
        for ms in [0u32, 1, 9, 10, 250, 1000, 65_535, u32::MAX] {
            let delay = StreamDelay::from_millis(ms);
            let bytes = Command::SetStreamDelay(delay).encode();
            assert_eq!(decode_delay_payload(&bytes), Some(delay));
        }
    }

    #[test]
    fn delay_payload_rejects_garbage() {
        assert_eq!(decode_delay_payload(b""), None);
        assert_eq!(decode_delay_payload(b"\x04x"), None);
        assert_eq!(decode_delay_payload(b"\x0412"), None);
        assert_eq!(decode_delay_payload(b"\x041a2x"), None);
        assert_eq!(decode_delay_payload(b"\x03100x"), None);
    }

    #[test]
    fn codes_round_trip_through_bytes() {
        for code in CommandCode::ALL {
            assert_eq!(CommandCode::from_byte(code.byte()), Some(code));
        }
        assert_eq!(CommandCode::from_byte(6), None);
    }
}
