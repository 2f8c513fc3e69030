//! Serial acquisition driver for microcontroller-attached sensors.
//!
//! This crate talks to a board (typically an Arduino reading a load cell) that
//! streams `"<ms>,<value>\n"` lines over USB serial, collects them into a
//! session buffer that a live display can follow, and records finished sessions
//! for later analysis.
//!
//! # Typical flow
//!
//! 1. [`discover`] the board and open a [`DeviceLink`]
//! 2. optionally [`DeviceLink::tare`], then [`DeviceLink::handshake`]
//! 3. run a [`StreamSession`], bounded ([`StreamSession::acquire`]) or live
//!    ([`StreamSession::spawn_live`])
//! 4. analyze the [`SampleBuffer`] with [`analysis`] and store it with a
//!    [`SessionRecorder`]
//!
//! # Timing
//!
//! Timestamps come from the device clock (milliseconds since `StartStream`), not
//! from the host. Host-side latency therefore never shows up in the series; the
//! nominal stream delay is only recorded as metadata.

pub mod analysis;
mod buffer;
pub mod config;
mod errors;
mod frame;
mod link;
pub mod logging;
pub mod protocol;
mod recorder;
mod session;

pub use analysis::{DerivativeSeries, Excursion};
pub use buffer::{Append, HorizonPolicy, Rescale, SampleBuffer};
pub use config::AcquisitionConfig;
pub use errors::*;
pub use frame::{parse as parse_frame, Sample};
pub use link::{
    discover, discover_in, list_ports, DeviceLink, HandshakeResult, LinkConfig, PortInfo,
    SerialTransport, Transport, DEFAULT_MANUFACTURER,
};
pub use protocol::{Command, CommandCode, StreamDelay, BAUD_RATE};
pub use recorder::{
    is_reserved_name, load_buffer, AttrValue, Dataset, Group, GroupHandle, JsonFileStore,
    MemoryStore, MetadataForm, SessionKey, SessionRecorder, SessionStore, RESERVED_NAMES,
};
pub use session::{
    FinishedSession, LiveAcquisition, LiveEvent, Renderer, SessionConfig, SessionEnd,
    SessionMetadata, SessionState, StreamSession, StreamStats,
};
