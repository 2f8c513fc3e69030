//! Append-only sample store for one acquisition session.
//!
//! Besides the samples themselves the buffer tracks two display bounds that
//! only ever grow: the time horizon and the value-axis upper bound. A renderer
//! widens its axes when an append reports a [`Rescale`]; nothing downstream is
//! required to act on it.

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::frame::Sample;

/// How the display bounds grow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonPolicy {
    /// Initial time horizon and the step it grows by, in device milliseconds.
    pub time_increment_ms: u64,
    /// Value-axis upper bound before any sample exceeds it.
    pub initial_value_bound: f64,
    /// Room kept above a new maximum when the value axis grows.
    pub value_headroom: f64,
}

impl Default for HorizonPolicy {
    fn default() -> Self {
        Self {
            time_increment_ms: 10_000,
            initial_value_bound: 3.0,
            value_headroom: 1.0,
        }
    }
}

/// Render hint emitted when either display bound grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub time_bound_ms: u64,
    pub value_bound: f64,
}

/// Outcome of a successful [`SampleBuffer::append`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Append {
    /// Stored; carries a rescale hint when a display bound grew.
    Stored(Option<Rescale>),
    /// Same timestamp and value as the last sample; nothing changed.
    Duplicate,
}

impl Append {
    pub fn is_stored(&self) -> bool {
        matches!(self, Append::Stored(_))
    }

    pub fn rescale(&self) -> Option<Rescale> {
        match self {
            Append::Stored(r) => *r,
            Append::Duplicate => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: Vec<Sample>,
    policy: HorizonPolicy,
    observed_max_value: Option<f64>,
    visible_horizon_ms: u64,
    value_bound: f64,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(HorizonPolicy::default())
    }
}

impl SampleBuffer {
    pub fn new(policy: HorizonPolicy) -> Self {
        Self {
            samples: Vec::new(),
            // A zero increment would never move the horizon past a sample.
            visible_horizon_ms: policy.time_increment_ms.max(1),
            value_bound: policy.initial_value_bound,
            observed_max_value: None,
            policy,
        }
    }

    /// Build a buffer from already-recorded samples, e.g. loaded from a store.
    pub fn from_samples<I>(policy: HorizonPolicy, samples: I) -> Result<Self>
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut buffer = Self::new(policy);
        for sample in samples {
            buffer.append(sample)?;
        }
        Ok(buffer)
    }

    /// Append a sample.
    ///
    /// A timestamp earlier than the last one fails with
    /// [`DriverError::OutOfOrder`] and leaves the buffer untouched. Repeating the
    /// last sample exactly is a no-op.
    pub fn append(&mut self, sample: Sample) -> Result<Append> {
        if let Some(last) = self.samples.last() {
            if sample.device_time_ms < last.device_time_ms {
                return Err(DriverError::OutOfOrder {
                    last: last.device_time_ms,
                    got: sample.device_time_ms,
                });
            }
            if sample.device_time_ms == last.device_time_ms && sample.value == last.value {
                return Ok(Append::Duplicate);
            }
        }

        self.samples.push(sample);

        let mut rescaled = false;
        let t = sample.device_time_ms;
        if t >= self.visible_horizon_ms && self.visible_horizon_ms < u64::MAX {
            // smallest whole number of increments that moves the horizon past t
            let step = self.policy.time_increment_ms.max(1);
            let steps = (t - self.visible_horizon_ms) / step + 1;
            self.visible_horizon_ms = self
                .visible_horizon_ms
                .saturating_add(steps.saturating_mul(step));
            rescaled = true;
        }

        let new_max = self
            .observed_max_value
            .map_or(sample.value, |m| m.max(sample.value));
        if self.observed_max_value.map_or(true, |m| new_max > m) {
            self.observed_max_value = Some(new_max);
            let wanted = new_max + self.policy.value_headroom;
            if wanted > self.value_bound {
                self.value_bound = wanted;
                rescaled = true;
            }
        }

        Ok(Append::Stored(rescaled.then(|| self.bounds())))
    }

    pub fn bounds(&self) -> Rescale {
        Rescale {
            time_bound_ms: self.visible_horizon_ms,
            value_bound: self.value_bound,
        }
    }

    pub fn visible_horizon(&self) -> u64 {
        self.visible_horizon_ms
    }

    pub fn value_bound(&self) -> f64 {
        self.value_bound
    }

    pub fn observed_max_value(&self) -> Option<f64> {
        self.observed_max_value
    }

    /// The sample with the greatest value (first one on ties).
    pub fn peak(&self) -> Option<Sample> {
        self.samples.iter().copied().reduce(|best, s| {
            if s.value > best.value {
                s
            } else {
                best
            }
        })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn policy(&self) -> HorizonPolicy {
        self.policy
    }

    pub fn times_ms(&self) -> Vec<u64> {
        self.samples.iter().map(|s| s.device_time_ms).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}
