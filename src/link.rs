//! Serial link to the acquisition board.
//!
//! [`DeviceLink`] turns an opened port into a validated channel: it resets the
//! connection, waits for the board to come back up, and checks that it answers
//! the handshake before anything is streamed.
//!
//! # Reset on connect
//!
//! Most Arduino-style boards reboot when the port is (re)opened, and stale
//! driver buffers can hold half a line from a previous run. Handshake and tare
//! therefore both start by closing and reopening the port, sleeping for the
//! settle delay and discarding whatever input is already buffered.
//!
//! All I/O goes through the narrow [`Transport`] trait so the protocol logic can
//! run against a scripted fake instead of hardware.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use crate::config::duration_ms;
use crate::errors::{DriverError, Result};
use crate::frame::{self, Sample};
use crate::protocol::{self, Command, CommandCode, BAUD_RATE, LINE_TERMINATOR};

// ============================================================================
// Constants
// ============================================================================

/// Manufacturer substring used by [`discover`] when no filter is given.
pub const DEFAULT_MANUFACTURER: &str = "Arduino";

/// Read timeout outside of handshakes.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Time the board needs after a port reopen before it listens again.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Read timeout while waiting for handshake replies.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    pub handshake_code: CommandCode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_code: CommandCode::Handshake,
        }
    }
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Byte-level channel to the device.
///
/// Implementations report a dead channel (unplugged cable, closed port) as
/// [`DriverError::LinkLost`]. A read that simply times out is not an error.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read through the next newline.
    ///
    /// Returns `Ok(None)` when the timeout expires with nothing read. When it
    /// expires mid-line the partial bytes are returned without a newline.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close and reopen the underlying connection.
    fn reopen(&mut self) -> Result<()>;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Drop any input already received but not yet read.
    fn clear_input(&mut self) -> Result<()>;
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// [`Transport`] over a `serialport` handle.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    reader: Option<BufReader<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        debug!("opened serial port {path} at {baud_rate} baud");
        Ok(Self {
            path: path.to_string(),
            baud_rate,
            timeout,
            reader: Some(BufReader::new(port)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn reader(&mut self) -> Result<&mut BufReader<Box<dyn SerialPort>>> {
        let path = &self.path;
        self.reader
            .as_mut()
            .ok_or_else(|| DriverError::LinkLost(format!("{path} is closed")))
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.reader()?.get_mut();
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| DriverError::LinkLost(format!("write failed: {e}")))
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader()?;
        let mut line = Vec::with_capacity(32);
        match reader.read_until(LINE_TERMINATOR, &mut line) {
            Ok(_) => {}
            Err(e) if is_timeout(e.kind()) => {}
            Err(e) => return Err(DriverError::LinkLost(format!("read failed: {e}"))),
        }
        Ok((!line.is_empty()).then_some(line))
    }

    fn reopen(&mut self) -> Result<()> {
        // the old handle must be released before the device can be opened again
        self.reader = None;
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        self.reader = Some(BufReader::new(port));
        debug!("reopened serial port {}", self.path);
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.reader()?.get_mut().set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        let reader = self.reader()?;
        let buffered = reader.buffer().len();
        reader.consume(buffered);
        reader.get_ref().clear(ClearBuffer::Input)?;
        Ok(())
    }
}

// ============================================================================
// Port Discovery
// ============================================================================

/// A serial port as advertised by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub device_id: String,
    pub manufacturer: Option<String>,
}

/// List the serial ports present on this machine.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| PortInfo {
            manufacturer: match p.port_type {
                SerialPortType::UsbPort(usb) => usb.manufacturer,
                _ => None,
            },
            device_id: p.port_name,
        })
        .collect())
}

/// Find the first port whose manufacturer contains `filter` (case-sensitive,
/// [`DEFAULT_MANUFACTURER`] when `None`).
pub fn discover(filter: Option<&str>) -> Result<String> {
    discover_in(&list_ports()?, filter)
}

/// [`discover`] over an explicit port list.
pub fn discover_in(ports: &[PortInfo], filter: Option<&str>) -> Result<String> {
    let filter = filter.unwrap_or(DEFAULT_MANUFACTURER);
    let matches: Vec<&PortInfo> = ports
        .iter()
        .filter(|p| p.manufacturer.as_deref().is_some_and(|m| m.contains(filter)))
        .collect();

    match matches.as_slice() {
        [] => Err(DriverError::PortNotFound {
            filter: filter.to_string(),
        }),
        [only] => Ok(only.device_id.clone()),
        [first, ..] => {
            let ids: Vec<&str> = matches.iter().map(|p| p.device_id.as_str()).collect();
            warn!(
                "several ports match {:?}: {:?}; using {}",
                filter, ids, first.device_id
            );
            Ok(first.device_id.clone())
        }
    }
}

// ============================================================================
// Device Link
// ============================================================================

/// Outcome of a handshake. `message` is the reply to the second exchange with
/// line terminators stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub ok: bool,
    pub message: String,
}

/// Exclusive owner of the connection to one board.
///
/// # Example
/// ```ignore
/// let port = discover(None)?;
/// let mut link = DeviceLink::open(&port, LinkConfig::default())?;
/// link.tare()?;
/// let hs = link.handshake()?;
/// println!("device says {}", hs.message);
/// ```
pub struct DeviceLink {
    transport: Box<dyn Transport>,
    config: LinkConfig,
    tare_applied: bool,
}

impl DeviceLink {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open a serial port (e.g. `/dev/ttyACM0`) with the configured baud rate.
    pub fn open(path: &str, config: LinkConfig) -> Result<Self> {
        let transport = SerialTransport::open(path, config.baud_rate, config.read_timeout)?;
        Ok(Self::from_transport(Box::new(transport), config))
    }

    pub fn from_transport(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            transport,
            config,
            tare_applied: false,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Whether a tare has been sent over this link.
    pub fn tare_applied(&self) -> bool {
        self.tare_applied
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Handshake with the configured settle delay and code.
    pub fn handshake(&mut self) -> Result<HandshakeResult> {
        self.handshake_with(self.config.settle_delay, self.config.handshake_code)
    }

    /// Reset the link and perform two handshake exchanges.
    ///
    /// The first reply is a warm-up, the second is returned. The read timeout is
    /// widened to `handshake_timeout` for the exchanges and restored afterwards,
    /// also on failure.
    pub fn handshake_with(
        &mut self,
        settle_delay: Duration,
        code: CommandCode,
    ) -> Result<HandshakeResult> {
        self.reset(settle_delay)?;

        let original = self.transport.timeout();
        self.transport.set_timeout(self.config.handshake_timeout)?;

        let exchanged = self
            .clear_and_exchange(code)
            .and_then(|_| self.exchange(code));
        let restored = self.transport.set_timeout(original);

        let message = exchanged?;
        restored?;

        info!("handshake ok: {message:?}");
        Ok(HandshakeResult {
            ok: !message.is_empty(),
            message,
        })
    }

    /// Reset the link and send `Tare`. No reply is read; give the device time to
    /// settle before relying on the new zero.
    pub fn tare(&mut self) -> Result<()> {
        self.reset(self.config.settle_delay)?;
        self.transport.clear_input()?;
        self.send(Command::Tare)?;
        self.tare_applied = true;
        info!("tare sent");
        Ok(())
    }

    /// Single-shot reading. `Ok(None)` when the device does not answer within the
    /// read timeout; a garbled reply is surfaced, not retried.
    pub fn request_value(&mut self) -> Result<Option<Sample>> {
        self.send(Command::ValueRequest)?;
        match self.transport.read_line()? {
            Some(line) => Ok(Some(frame::parse(&line)?)),
            None => Ok(None),
        }
    }

    pub fn send(&mut self, command: Command) -> Result<()> {
        debug!("send {command:?}");
        self.transport.write_all(&command.encode())
    }

    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.transport.read_line()
    }

    pub fn read_timeout(&self) -> Duration {
        self.transport.timeout()
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.transport.set_timeout(timeout)
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn reset(&mut self, settle_delay: Duration) -> Result<()> {
        self.transport.reopen()?;
        if !settle_delay.is_zero() {
            debug!("waiting {settle_delay:?} for device to settle");
            std::thread::sleep(settle_delay);
        }
        Ok(())
    }

    fn clear_and_exchange(&mut self, code: CommandCode) -> Result<String> {
        self.transport.clear_input()?;
        let warmup = self.exchange(code)?;
        debug!("handshake warm-up reply: {warmup:?}");
        Ok(warmup)
    }

    /// Send `code` and wait for one full line.
    fn exchange(&mut self, code: CommandCode) -> Result<String> {
        self.transport.write_all(&protocol::encode_code(code))?;
        match self.transport.read_line()? {
            Some(line) if line.last() == Some(&LINE_TERMINATOR) => {
                Ok(String::from_utf8_lossy(&line).trim_end().to_string())
            }
            _ => Err(DriverError::HandshakeTimeout(self.config.handshake_timeout)),
        }
    }
}
