#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pullscale::{DeviceLink, DriverError, LinkConfig, Result, Transport};

/// What the fake device does on the next `read_line`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Line(Vec<u8>),
    Timeout,
    Lost,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub written: Vec<Vec<u8>>,
    pub replies: VecDeque<Reply>,
    pub timeout: Duration,
    pub timeout_history: Vec<Duration>,
    pub reopens: usize,
    pub clears: usize,
    /// Sleep applied to reads once the script is exhausted.
    pub idle_read: Duration,
    /// Zero-based index of a write attempt that fails; failed writes are not
    /// recorded in `written`.
    pub fail_write_at: Option<usize>,
    pub write_attempts: usize,
}

/// Scripted stand-in for a serial board. Clones share state, so a test keeps one
/// handle while the link owns another.
#[derive(Debug, Clone)]
pub struct FakeDevice(Arc<Mutex<FakeState>>);

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice(Arc::new(Mutex::new(FakeState {
            timeout: Duration::from_secs(1),
            ..FakeState::default()
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    pub fn push_line(&self, line: &[u8]) -> &Self {
        self.state().replies.push_back(Reply::Line(line.to_vec()));
        self
    }

    pub fn push_lines(&self, lines: &[&[u8]]) -> &Self {
        for line in lines {
            self.push_line(line);
        }
        self
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.state().replies.push_back(reply);
        self
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn link(&self) -> DeviceLink {
        DeviceLink::from_transport(Box::new(self.clone()), quick_link_config())
    }
}

/// Link settings without real-time waits.
pub fn quick_link_config() -> LinkConfig {
    LinkConfig {
        settle_delay: Duration::ZERO,
        ..LinkConfig::default()
    }
}

impl Transport for FakeDevice {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut st = self.state();
        let attempt = st.write_attempts;
        st.write_attempts += 1;
        if st.fail_write_at == Some(attempt) {
            return Err(DriverError::LinkLost("write failed".into()));
        }
        st.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let (next, idle) = {
            let mut st = self.state();
            (st.replies.pop_front(), st.idle_read)
        };
        match next {
            Some(Reply::Line(l)) => Ok(Some(l)),
            Some(Reply::Timeout) => Ok(None),
            Some(Reply::Lost) => Err(DriverError::LinkLost("cable pulled".into())),
            None => {
                if !idle.is_zero() {
                    std::thread::sleep(idle);
                }
                Ok(None)
            }
        }
    }

    fn reopen(&mut self) -> Result<()> {
        self.state().reopens += 1;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let mut st = self.state();
        st.timeout = timeout;
        st.timeout_history.push(timeout);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.state().clears += 1;
        Ok(())
    }
}
