//! Finite-difference features over a finished buffer.
//!
//! Slopes use the elapsed device time between neighbours, not the nominal
//! stream delay, so jitter and dropped lines do not distort them. Units are
//! value per millisecond.
//!
//! The first derivative at index `i` is the slope from sample `i` to `i + 1` and
//! is placed on sample `i`'s timestamp. The second derivative repeats that over
//! the first-derivative series and its own time axis.

use std::ops::Range;

use crate::buffer::SampleBuffer;

/// First and second derivatives with their time axes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivativeSeries {
    pub first_time_ms: Vec<u64>,
    pub first: Vec<f64>,
    pub second_time_ms: Vec<u64>,
    pub second: Vec<f64>,
}

/// Indices of the steepest rise and steepest fall of a derivative series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Excursion {
    pub max_index: usize,
    pub min_index: usize,
}

impl Excursion {
    /// `max_index..min_index` when the rise precedes the fall. `None` otherwise;
    /// the caller decides how to treat a fall that comes first.
    pub fn ordered_range(&self) -> Option<Range<usize>> {
        (self.max_index < self.min_index).then_some(self.max_index..self.min_index)
    }
}

/// Slope between adjacent points. Zero elapsed time gives NaN.
fn difference(times: &[u64], values: &[f64]) -> Vec<f64> {
    times
        .windows(2)
        .zip(values.windows(2))
        .map(|(t, v)| {
            let dt = t[1] as f64 - t[0] as f64;
            if dt == 0.0 {
                f64::NAN
            } else {
                (v[1] - v[0]) / dt
            }
        })
        .collect()
}

/// `len - 1` slopes, empty for fewer than two samples.
pub fn first_derivative(buffer: &SampleBuffer) -> Vec<f64> {
    difference(&buffer.times_ms(), &buffer.values())
}

/// `len - 2` values, empty for fewer than three samples.
pub fn second_derivative(buffer: &SampleBuffer) -> Vec<f64> {
    derivatives(buffer).second
}

pub fn derivatives(buffer: &SampleBuffer) -> DerivativeSeries {
    let times = buffer.times_ms();
    let first = difference(&times, &buffer.values());
    let first_time_ms: Vec<u64> = times.iter().copied().take(first.len()).collect();
    let second = difference(&first_time_ms, &first);
    let second_time_ms = first_time_ms.iter().copied().take(second.len()).collect();
    DerivativeSeries {
        first_time_ms,
        first,
        second_time_ms,
        second,
    }
}

/// Global argmax and argmin of `series`, skipping non-finite entries. The first
/// occurrence wins on ties. `None` when nothing finite is left.
pub fn dominant_excursion(series: &[f64]) -> Option<Excursion> {
    let mut finite = series
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite());
    let (i0, v0) = finite.next()?;
    let (mut max_index, mut max) = (i0, v0);
    let (mut min_index, mut min) = (i0, v0);
    for (i, v) in finite {
        if v > max {
            max = v;
            max_index = i;
        }
        if v < min {
            min = v;
            min_index = i;
        }
    }
    Some(Excursion {
        max_index,
        min_index,
    })
}
