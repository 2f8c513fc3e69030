use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("no serial port matching manufacturer {filter:?}")]
    PortNotFound { filter: String },
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error("out of order sample: t={got} ms precedes last t={last} ms")]
    OutOfOrder { last: u64, got: u64 },
    #[error("session {0} already exists in store")]
    DuplicateSession(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

/// Recoverable failures of a single device line. Callers discard the line and
/// read the next one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("incomplete frame (no trailing newline)")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
