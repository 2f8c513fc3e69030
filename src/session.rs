//! One start-to-stop acquisition run.
//!
//! A [`StreamSession`] moves through
//! `Idle -> Configuring -> Streaming -> Draining -> Closed` exactly once.
//! `StartStream` and `StopStream` are always sent as a pair; a closed session
//! cannot be restarted, build a new one from [`FinishedSession::into_link`].
//!
//! # Recovery
//!
//! Lines that fail to parse are discarded and the next line is read. Empty
//! reads (timeouts) are treated the same way. To keep a dead or desynchronized
//! device from hanging the loop forever, `max_consecutive_failures` such reads
//! in a row end the session with [`DriverError::LinkLost`].
//!
//! # Live mode
//!
//! [`StreamSession::spawn_live`] moves the session onto its own thread and hands
//! samples to the caller through a bounded channel. The consumer polls without
//! blocking, so a stalled device never freezes the display. If the consumer falls
//! behind, events are dropped from the channel (the session buffer still keeps
//! every sample).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, TrySendError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::{Append, HorizonPolicy, Rescale, SampleBuffer};
use crate::config::duration_ms;
use crate::errors::{DriverError, FrameError, Result};
use crate::frame::{self, Sample};
use crate::link::DeviceLink;
use crate::protocol::{Command, StreamDelay};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unusable reads in a row before the link is declared lost. 0 disables the
    /// bound.
    pub max_consecutive_failures: u32,
    /// Added to the stream delay to get the per-read timeout while streaming.
    #[serde(with = "duration_ms")]
    pub stream_timeout_margin: Duration,
    /// Capacity of the live event channel.
    pub live_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 50,
            stream_timeout_margin: Duration::from_millis(500),
            live_channel_capacity: 1024,
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Streaming,
    Draining,
    Closed,
}

/// How a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Never started.
    NotStarted,
    /// Bounded run reached its target.
    Completed,
    /// Unbounded run stopped on request.
    Cancelled,
    /// Ended without a clean stop.
    LinkLost(String),
}

/// Per-session read counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub accepted: u64,
    pub malformed_frames: u64,
    pub incomplete_frames: u64,
    pub timeouts: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    /// Live events the consumer did not pick up in time.
    pub dropped_events: u64,
}

impl StreamStats {
    /// Lines discarded by the frame parser.
    pub fn rejected_frames(&self) -> u64 {
        self.malformed_frames + self.incomplete_frames
    }
}

/// Descriptive data recorded alongside the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub started_at: DateTime<Local>,
    pub sample_interval_ms: u32,
    pub tare_applied: bool,
    /// Free-form caller annotations (subject, hold size, ...).
    pub attributes: BTreeMap<String, String>,
}

impl SessionMetadata {
    pub fn new(started_at: DateTime<Local>) -> Self {
        Self {
            started_at,
            sample_interval_ms: 0,
            tare_applied: false,
            attributes: BTreeMap::new(),
        }
    }
}

/// Capabilities a live display offers to the acquisition engine.
pub trait Renderer {
    fn on_sample(&mut self, sample: &Sample);

    fn on_rescale(&mut self, _time_bound_ms: u64, _value_bound: f64) {}
}

// ============================================================================
// Stream Session
// ============================================================================

pub struct StreamSession {
    link: DeviceLink,
    config: SessionConfig,
    state: SessionState,
    buffer: SampleBuffer,
    metadata: SessionMetadata,
    stats: StreamStats,
    consecutive_failures: u32,
    saved_timeout: Option<Duration>,
    end: SessionEnd,
}

impl StreamSession {
    pub fn new(link: DeviceLink, config: SessionConfig, policy: HorizonPolicy) -> Self {
        Self {
            link,
            config,
            state: SessionState::Idle,
            buffer: SampleBuffer::new(policy),
            metadata: SessionMetadata::new(Local::now()),
            stats: StreamStats::default(),
            consecutive_failures: 0,
            saved_timeout: None,
            end: SessionEnd::NotStarted,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.attributes.insert(key.into(), value.into());
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Collect `target` samples, then stop the stream.
    pub fn acquire(&mut self, target: usize, delay: StreamDelay) -> Result<&SampleBuffer> {
        self.acquire_with(target, delay, |_, _| {})?;
        Ok(&self.buffer)
    }

    /// Like [`acquire`](Self::acquire), reporting each stored sample.
    pub fn acquire_with<F>(
        &mut self,
        target: usize,
        delay: StreamDelay,
        mut on_sample: F,
    ) -> Result<()>
    where
        F: FnMut(&Sample, Option<Rescale>),
    {
        self.begin(delay)?;
        let mut collected = 0usize;
        while collected < target {
            if let Some((sample, rescale)) = self.poll()? {
                collected += 1;
                on_sample(&sample, rescale);
            }
        }
        self.drain(SessionEnd::Completed)
    }

    /// Stream until `cancel` is set. The flag is checked between reads, so
    /// stopping takes at most one read timeout.
    pub fn stream<F>(
        &mut self,
        delay: StreamDelay,
        cancel: &AtomicBool,
        mut on_sample: F,
    ) -> Result<()>
    where
        F: FnMut(&Sample, Option<Rescale>),
    {
        self.begin(delay)?;
        while !cancel.load(Ordering::Acquire) {
            if let Some((sample, rescale)) = self.poll()? {
                on_sample(&sample, rescale);
            }
        }
        self.drain(SessionEnd::Cancelled)
    }

    /// [`stream`](Self::stream) into a renderer on the current thread.
    pub fn stream_to(
        &mut self,
        delay: StreamDelay,
        cancel: &AtomicBool,
        renderer: &mut dyn Renderer,
    ) -> Result<()> {
        self.stream(delay, cancel, |sample, rescale| {
            renderer.on_sample(sample);
            if let Some(r) = rescale {
                renderer.on_rescale(r.time_bound_ms, r.value_bound);
            }
        })
    }

    /// Run an unbounded session on a dedicated thread.
    pub fn spawn_live(self, delay: StreamDelay) -> Result<LiveAcquisition> {
        let (tx, rx) = bounded(self.config.live_channel_capacity.max(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = std::thread::Builder::new()
            .name("pullscale-acquire".into())
            .spawn(move || {
                let mut session = self;
                let mut dropped = 0u64;
                let mut push = |event: LiveEvent| match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => dropped += 1,
                    Err(TrySendError::Disconnected(_)) => flag.store(true, Ordering::Release),
                };
                let result = session.stream(delay, &flag, |sample, rescale| {
                    push(LiveEvent::Sample(*sample));
                    if let Some(r) = rescale {
                        push(LiveEvent::Rescale(r));
                    }
                });
                session.stats.dropped_events = dropped;
                if dropped > 0 {
                    warn!("live consumer fell behind, {dropped} events dropped");
                }
                if let Err(e) = &result {
                    warn!("live acquisition ended: {e}");
                }
                session
            })?;

        Ok(LiveAcquisition {
            events: rx,
            cancel,
            handle,
        })
    }

    /// Freeze the session. Works in any state; a session that never started
    /// yields an empty buffer.
    pub fn finish(self) -> FinishedSession {
        FinishedSession {
            buffer: self.buffer,
            metadata: self.metadata,
            stats: self.stats,
            end: self.end,
            link: self.link,
        }
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn begin(&mut self, delay: StreamDelay) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(DriverError::InvalidState(format!(
                "session is {:?}, a new session is needed for another run",
                self.state
            )));
        }

        self.state = SessionState::Configuring;
        self.metadata.started_at = Local::now();
        self.metadata.sample_interval_ms = delay.as_millis();
        self.metadata.tare_applied = self.link.tare_applied();

        let configured = self.configure(delay);
        if let Err(e) = configured {
            return Err(self.abort(e));
        }

        self.state = SessionState::Streaming;
        info!("streaming started (delay {delay})");
        Ok(())
    }

    fn configure(&mut self, delay: StreamDelay) -> Result<()> {
        let original = self.link.read_timeout();
        self.link
            .set_read_timeout(delay.as_duration() + self.config.stream_timeout_margin)?;
        self.saved_timeout = Some(original);
        self.link.send(Command::SetStreamDelay(delay))?;
        self.link.send(Command::StartStream)
    }

    /// One read. `Some` when a sample was stored.
    fn poll(&mut self) -> Result<Option<(Sample, Option<Rescale>)>> {
        match self.step() {
            Ok(v) => Ok(v),
            Err(e) => Err(self.abort(e)),
        }
    }

    fn step(&mut self) -> Result<Option<(Sample, Option<Rescale>)>> {
        let Some(raw) = self.link.read_line()? else {
            self.stats.timeouts += 1;
            return self.failed_read().map(|_| None);
        };

        let sample = match frame::parse(&raw) {
            Ok(sample) => sample,
            Err(FrameError::Incomplete) => {
                self.stats.incomplete_frames += 1;
                return self.failed_read().map(|_| None);
            }
            Err(FrameError::Malformed(reason)) => {
                self.stats.malformed_frames += 1;
                debug!("discarding frame: {reason}");
                return self.failed_read().map(|_| None);
            }
        };

        match self.buffer.append(sample) {
            Ok(Append::Stored(rescale)) => {
                self.consecutive_failures = 0;
                self.stats.accepted += 1;
                Ok(Some((sample, rescale)))
            }
            Ok(Append::Duplicate) => {
                self.consecutive_failures = 0;
                self.stats.duplicates += 1;
                Ok(None)
            }
            Err(e @ DriverError::OutOfOrder { .. }) => {
                self.stats.out_of_order += 1;
                warn!("{e}");
                self.failed_read().map(|_| None)
            }
            Err(e) => Err(e),
        }
    }

    fn failed_read(&mut self) -> Result<()> {
        self.consecutive_failures += 1;
        let limit = self.config.max_consecutive_failures;
        if limit > 0 && self.consecutive_failures >= limit {
            return Err(DriverError::LinkLost(format!(
                "{} consecutive reads without a valid frame",
                self.consecutive_failures
            )));
        }
        Ok(())
    }

    fn drain(&mut self, end: SessionEnd) -> Result<()> {
        self.state = SessionState::Draining;
        let stopped = self.link.send(Command::StopStream);
        let restored = match self.saved_timeout.take() {
            Some(t) => self.link.set_read_timeout(t),
            None => Ok(()),
        };
        if let Err(e) = stopped.and(restored) {
            return Err(self.abort(e));
        }

        self.state = SessionState::Closed;
        self.end = end;
        self.log_summary();
        Ok(())
    }

    /// Close without a clean stop. `StopStream` is attempted, best effort, only
    /// when `StartStream` went out.
    fn abort(&mut self, err: DriverError) -> DriverError {
        warn!("session aborted in {:?}: {err}", self.state);
        if self.state == SessionState::Streaming {
            let _ = self.link.send(Command::StopStream);
        }
        if let Some(t) = self.saved_timeout.take() {
            let _ = self.link.set_read_timeout(t);
        }
        self.state = SessionState::Closed;
        self.end = SessionEnd::LinkLost(err.to_string());
        self.log_summary();
        match err {
            e @ DriverError::LinkLost(_) => e,
            other => DriverError::LinkLost(other.to_string()),
        }
    }

    fn log_summary(&self) {
        let s = &self.stats;
        info!(
            "session closed: {} samples, {} rejected frames, {} timeouts",
            s.accepted,
            s.rejected_frames(),
            s.timeouts
        );
        if s.rejected_frames() > 0 || s.out_of_order > 0 {
            warn!(
                "discarded {} malformed, {} incomplete, {} out-of-order frames",
                s.malformed_frames, s.incomplete_frames, s.out_of_order
            );
        }
    }
}

/// A closed session: everything needed for analysis and recording.
pub struct FinishedSession {
    pub buffer: SampleBuffer,
    pub metadata: SessionMetadata,
    pub stats: StreamStats,
    pub end: SessionEnd,
    link: DeviceLink,
}

impl FinishedSession {
    /// Annotate after the run, before recording.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.attributes.insert(key.into(), value.into());
    }

    /// Hand the link back for another session.
    pub fn into_link(self) -> DeviceLink {
        self.link
    }
}

// ============================================================================
// Live Handoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LiveEvent {
    Sample(Sample),
    Rescale(Rescale),
}

impl LiveEvent {
    pub fn dispatch(self, renderer: &mut dyn Renderer) {
        match self {
            LiveEvent::Sample(s) => renderer.on_sample(&s),
            LiveEvent::Rescale(r) => renderer.on_rescale(r.time_bound_ms, r.value_bound),
        }
    }
}

/// Handle to a session running on its own thread.
pub struct LiveAcquisition {
    events: Receiver<LiveEvent>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<StreamSession>,
}

impl LiveAcquisition {
    /// Deliver everything queued so far without blocking. Returns the number of
    /// events dispatched.
    pub fn poll(&self, renderer: &mut dyn Renderer) -> usize {
        let mut n = 0;
        for event in self.events.try_iter() {
            event.dispatch(renderer);
            n += 1;
        }
        n
    }

    pub fn events(&self) -> &Receiver<LiveEvent> {
        &self.events
    }

    /// Shared stop flag, e.g. for a Ctrl-C handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// The acquisition thread has exited (cancelled or link lost).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request a stop and wait for the session to close. Events still queued are
    /// dispatched to `renderer` first.
    ///
    /// A lost link does not make this fail: the samples gathered so far are
    /// still returned. Check [`FinishedSession::end`] for
    /// [`SessionEnd::LinkLost`] to tell a clean stop from a dropped device.
    pub fn stop(self, renderer: &mut dyn Renderer) -> Result<FinishedSession> {
        self.cancel();
        let session = self
            .handle
            .join()
            .map_err(|_| DriverError::InvalidState("acquisition thread panicked".into()))?;
        for event in self.events.try_iter() {
            event.dispatch(renderer);
        }
        Ok(session.finish())
    }
}
