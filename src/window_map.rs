// src/window_map.rs
//
// Bookkeeping of which channels hold data and the time window resident in the
// ring for each. This is the source of truth for read availability.

use serde::Serialize;

use crate::types::TimeRange;

/// One row of the window map, as reported to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadedWindow {
    pub name: String,
    pub active: bool,
    pub window: TimeRange,
}

#[derive(Clone, Debug, Default)]
pub struct ChannelWindowMap {
    rows: Vec<LoadedWindow>,
}

impl ChannelWindowMap {
    /// Map over the recording's channels, all inactive.
    pub fn new<S: AsRef<str>>(channels: &[S]) -> Self {
        Self {
            rows: channels
                .iter()
                .map(|name| LoadedWindow {
                    name: name.as_ref().to_string(),
                    active: false,
                    window: TimeRange::EMPTY,
                })
                .collect(),
        }
    }

    /// Activate exactly `channels` with a zero-width window at `anchor`.
    /// Every other channel is deactivated.
    pub fn reset(&mut self, channels: &[String], anchor: i64) {
        for row in self.rows.iter_mut() {
            if channels.contains(&row.name) {
                row.active = true;
                row.window = TimeRange::at(anchor);
            } else {
                row.active = false;
                row.window = TimeRange::EMPTY;
            }
        }
    }

    pub fn deactivate_all(&mut self) {
        for row in self.rows.iter_mut() {
            row.active = false;
            row.window = TimeRange::EMPTY;
        }
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| r.active)
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.rows.iter().any(|r| r.active)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.rows.iter().any(|r| r.name == channel)
    }

    pub fn window(&self, channel: &str) -> Option<TimeRange> {
        self.rows
            .iter()
            .find(|r| r.name == channel && r.active)
            .map(|r| r.window)
    }

    /// Widest active window.
    pub fn largest_span(&self) -> Option<TimeRange> {
        self.rows
            .iter()
            .filter(|r| r.active)
            .map(|r| r.window)
            .max_by_key(|w| w.len())
    }

    fn for_active(&mut self, f: impl Fn(&mut TimeRange)) {
        for row in self.rows.iter_mut().filter(|r| r.active) {
            f(&mut row.window);
        }
    }

    pub fn set_start(&mut self, t: i64) {
        self.for_active(|w| w.start = t);
    }

    pub fn set_stop(&mut self, t: i64) {
        self.for_active(|w| w.end = t);
    }

    pub fn shift(&mut self, by: i64) {
        self.for_active(|w| *w = w.shifted(by));
    }

    /// Trim active windows so they lie inside `extent`.
    pub fn clamp_to(&mut self, extent: TimeRange) {
        self.for_active(|w| {
            let start = extent.clamp_time(w.start);
            let end = extent.clamp_time(w.end).max(start);
            *w = TimeRange::new(start, end);
        });
    }

    /// Whether every requested channel is active with `range` inside its
    /// window (edges inclusive).
    pub fn is_available(&self, channels: &[String], range: &TimeRange) -> bool {
        channels.iter().all(|name| {
            self.rows
                .iter()
                .any(|r| &r.name == name && r.active && r.window.contains_range(range))
        })
    }

    pub fn snapshot(&self) -> Vec<LoadedWindow> {
        self.rows.clone()
    }
}
