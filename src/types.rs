// src/types.rs
//
// Shared value types: microsecond time ranges, channel and recording metadata,
// and the time <-> sample index conversions used by every layer of the buffer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Microseconds per second, the uUTC scale.
pub const US_PER_SEC: f64 = 1_000_000.0;

/// Per-channel sample arrays keyed by channel name.
pub type ChannelSamples = BTreeMap<String, Vec<f64>>;

/// Half-open interval `[start, end)` of uUTC microsecond timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub const EMPTY: TimeRange = TimeRange { start: 0, end: 0 };

    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Zero-width range anchored at `t`.
    pub fn at(t: i64) -> Self {
        Self { start: t, end: t }
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Midpoint, rounded toward negative infinity.
    pub fn midpoint(&self) -> i64 {
        self.start + (self.end - self.start).div_euclid(2)
    }

    /// Inclusive containment of both edges of `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start
            && other.start <= self.end
            && self.start <= other.end
            && other.end <= self.end
    }

    /// Intersection with another range. `None` when nothing is left.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            Some(TimeRange { start, end })
        } else {
            None
        }
    }

    pub fn shifted(&self, by: i64) -> TimeRange {
        TimeRange {
            start: self.start + by,
            end: self.end + by,
        }
    }

    /// Clamp a timestamp into `[start, end]`.
    pub fn clamp_time(&self, t: i64) -> i64 {
        t.max(self.start).min(self.end)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Static description of one sampled signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    /// Sampling rate in samples per second
    pub fs: f64,
    #[serde(default)]
    pub unit: String,
    /// Multiply raw samples by this to get physical units
    #[serde(default = "default_ufact")]
    pub ufact: f64,
    /// Gaps in the recording for this channel, reported as NaN samples by sources
    #[serde(default)]
    pub discontinuities: Vec<TimeRange>,
}

fn default_ufact() -> f64 {
    1.0
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>, fs: f64) -> Self {
        Self {
            name: name.into(),
            fs,
            unit: String::new(),
            ufact: default_ufact(),
            discontinuities: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>, ufact: f64) -> Self {
        self.unit = unit.into();
        self.ufact = ufact;
        self
    }

    pub fn with_discontinuity(mut self, gap: TimeRange) -> Self {
        self.discontinuities.push(gap);
        self
    }

    /// Whether timestamp `t` falls inside a recorded gap.
    pub fn in_gap(&self, t: i64) -> bool {
        self.discontinuities
            .iter()
            .any(|gap| gap.start <= t && t < gap.end)
    }
}

/// Recording-level metadata shared by every data source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub recording_start: i64,
    pub recording_end: i64,
    pub channels: Vec<ChannelInfo>,
}

impl RecordingInfo {
    pub fn bounds(&self) -> TimeRange {
        TimeRange::new(self.recording_start, self.recording_end)
    }

    pub fn duration(&self) -> i64 {
        self.recording_end - self.recording_start
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn sampling_rates(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.fs).collect()
    }
}

/// Logical sample index of time `t` relative to `anchor`, truncated toward the anchor.
pub fn time_to_index(t: i64, anchor: i64, fs: f64) -> i64 {
    ((t - anchor) as f64 * fs / US_PER_SEC).trunc() as i64
}

/// Number of samples a span of `duration_us` holds at `fs`.
pub fn samples_in(duration_us: i64, fs: f64) -> usize {
    if duration_us <= 0 {
        return 0;
    }
    (duration_us as f64 * fs / US_PER_SEC).trunc() as usize
}

/// Sample delta for a time delta, rounded to the nearest sample.
pub fn sample_delta(by_us: i64, fs: f64) -> i64 {
    (fs * by_us as f64 / US_PER_SEC).round() as i64
}

/// Split `by` into (back, front) shares where the front takes `fb_ratio` of it.
/// The shares always sum to `by`.
pub fn split_by_ratio(by: i64, fb_ratio: f64) -> (i64, i64) {
    let back = (by as f64 * (1.0 - fb_ratio)).round() as i64;
    let back = back.clamp(0, by.max(0));
    (back, by - back)
}
