// src/ring.rs
//
// One circular store per active channel, addressed in uUTC time.
// Each channel keeps its own sampling rate and span; the span start is the
// time of logical index 0, so rolls and resizes only move the span.

use std::path::PathBuf;

use crate::error::BufferError;
use crate::store::CircularChannelStore;
use crate::types::{
    sample_delta, samples_in, split_by_ratio, time_to_index, ChannelInfo, ChannelSamples,
    TimeRange,
};

/// Where channel stores keep their samples.
#[derive(Clone, Debug, PartialEq)]
pub enum BackingKind {
    Memory,
    Disk { spill_dir: PathBuf },
}

struct ChannelSlot {
    name: String,
    fs: f64,
    span: TimeRange,
    store: CircularChannelStore,
}

impl ChannelSlot {
    /// Logical index range for `range`, clipped to capacity.
    fn index_range(&self, range: &TimeRange) -> (usize, usize) {
        let cap = self.store.capacity() as i64;
        let i = time_to_index(range.start, self.span.start, self.fs).clamp(0, cap);
        let j = time_to_index(range.end, self.span.start, self.fs).clamp(i, cap);
        (i as usize, j as usize)
    }
}

pub struct MultiChannelRing {
    slots: Vec<ChannelSlot>,
    backing: BackingKind,
}

impl MultiChannelRing {
    /// Allocate a zero-filled store for each channel, all covering `span`.
    pub fn new(
        channels: &[ChannelInfo],
        span: TimeRange,
        backing: BackingKind,
    ) -> Result<Self, BufferError> {
        let mut ring = Self {
            slots: Vec::with_capacity(channels.len()),
            backing,
        };
        for info in channels {
            ring.add_channel(info, span)?;
        }
        Ok(ring)
    }

    /// Ring with no channels. Reads return nothing and rolls are no-ops.
    pub fn empty(backing: BackingKind) -> Self {
        Self {
            slots: Vec::new(),
            backing,
        }
    }

    fn add_channel(&mut self, info: &ChannelInfo, span: TimeRange) -> Result<(), BufferError> {
        if info.fs <= 0.0 {
            return Err(BufferError::range(format!(
                "channel '{}' has sampling rate {}",
                info.name, info.fs
            )));
        }
        let capacity = samples_in(span.len(), info.fs);
        let store = match &self.backing {
            BackingKind::Memory => CircularChannelStore::in_memory(capacity),
            BackingKind::Disk { spill_dir } => CircularChannelStore::on_disk(spill_dir, capacity)?,
        };
        self.slots.push(ChannelSlot {
            name: info.name.clone(),
            fs: info.fs,
            span,
            store,
        });
        Ok(())
    }

    fn slot(&self, channel: &str) -> Option<&ChannelSlot> {
        self.slots.iter().find(|s| s.name == channel)
    }

    fn slot_mut(&mut self, channel: &str) -> Result<&mut ChannelSlot, BufferError> {
        self.slots
            .iter_mut()
            .find(|s| s.name == channel)
            .ok_or_else(|| BufferError::UnknownChannel(channel.to_string()))
    }

    pub fn channels(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.slot(channel).is_some()
    }

    pub fn span(&self, channel: &str) -> Option<TimeRange> {
        self.slot(channel).map(|s| s.span)
    }

    pub fn capacity(&self, channel: &str) -> Option<usize> {
        self.slot(channel).map(|s| s.store.capacity())
    }

    /// The widest channel span, or `None` when no channels are allocated.
    pub fn extent(&self) -> Option<TimeRange> {
        self.slots.iter().map(|s| s.span).max_by_key(|r| r.len())
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self.backing, BackingKind::Disk { .. })
    }

    /// Samples for `range` per channel. Channels not covering the range get an
    /// empty vector; callers check availability first.
    pub fn read(
        &self,
        channels: &[String],
        range: TimeRange,
    ) -> Result<ChannelSamples, BufferError> {
        let mut out = ChannelSamples::new();
        for name in channels {
            let samples = match self.slot(name) {
                Some(slot) if slot.span.contains_range(&range) => {
                    let (i, j) = slot.index_range(&range);
                    slot.store.read(i, j)?
                }
                _ => Vec::new(),
            };
            out.insert(name.clone(), samples);
        }
        Ok(out)
    }

    /// Write samples for `range` of one channel. Extra values past the range or
    /// capacity are dropped. Returns the number written.
    pub fn write(
        &mut self,
        channel: &str,
        range: TimeRange,
        values: &[f64],
    ) -> Result<usize, BufferError> {
        let slot = self.slot_mut(channel)?;
        if !slot.span.contains_range(&range) {
            return Err(BufferError::range(format!(
                "write {} outside span {} of '{}'",
                range, slot.span, channel
            )));
        }
        let (i, j) = slot.index_range(&range);
        let n = values.len().min(j - i);
        slot.store.write(i, &values[..n])?;
        Ok(n)
    }

    // ------------------------------------------------------------------------
    // Per-channel geometry
    // ------------------------------------------------------------------------

    /// Shift one channel's span by `by_time`, rolling its store by the nearest
    /// sample count for its rate.
    pub fn roll_channel(&mut self, channel: &str, by_time: i64) -> Result<(), BufferError> {
        let slot = self.slot_mut(channel)?;
        slot.store.roll(sample_delta(by_time, slot.fs));
        slot.span = slot.span.shifted(by_time);
        Ok(())
    }

    /// Grow one channel's span by `by_time`; `fb_ratio` of it goes to the later edge.
    /// The store grows to exactly the sample count of the new span.
    pub fn enlarge_channel(
        &mut self,
        channel: &str,
        by_time: i64,
        fb_ratio: f64,
    ) -> Result<(), BufferError> {
        if by_time <= 0 {
            return Err(BufferError::range(format!("enlarge by {} us", by_time)));
        }
        let slot = self.slot_mut(channel)?;
        let (back_time, front_time) = split_by_ratio(by_time, fb_ratio);
        let span = TimeRange::new(slot.span.start - back_time, slot.span.end + front_time);

        let by = samples_in(span.len(), slot.fs).saturating_sub(slot.store.capacity());
        let back = (sample_delta(back_time, slot.fs).max(0) as usize).min(by);
        slot.store.enlarge_edges(back, by - back)?;
        slot.span = span;
        Ok(())
    }

    /// Shrink one channel's span by `by_time`; `fb_ratio` of it comes off the later edge.
    /// The store shrinks to exactly the sample count of the new span.
    pub fn shrink_channel(
        &mut self,
        channel: &str,
        by_time: i64,
        fb_ratio: f64,
    ) -> Result<(), BufferError> {
        let slot = self.slot_mut(channel)?;
        if by_time <= 0 || by_time >= slot.span.len() {
            return Err(BufferError::range(format!(
                "shrink by {} us with span {}",
                by_time, slot.span
            )));
        }
        let (back_time, front_time) = split_by_ratio(by_time, fb_ratio);
        let span = TimeRange::new(slot.span.start + back_time, slot.span.end - front_time);

        let cap = slot.store.capacity();
        let by = cap - samples_in(span.len(), slot.fs).min(cap);
        let back = (sample_delta(back_time, slot.fs).max(0) as usize).min(by);
        slot.store.shrink_edges(back, by - back)?;
        slot.span = span;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Batched geometry
    // ------------------------------------------------------------------------

    pub fn roll(&mut self, by_time: i64) -> Result<(), BufferError> {
        for name in self.channels() {
            self.roll_channel(&name, by_time)?;
        }
        Ok(())
    }

    pub fn enlarge(&mut self, by_time: i64, fb_ratio: f64) -> Result<(), BufferError> {
        for name in self.channels() {
            self.enlarge_channel(&name, by_time, fb_ratio)?;
        }
        Ok(())
    }

    pub fn shrink(&mut self, by_time: i64, fb_ratio: f64) -> Result<(), BufferError> {
        for name in self.channels() {
            self.shrink_channel(&name, by_time, fb_ratio)?;
        }
        Ok(())
    }

    /// Release every channel store (deleting spill files) and forget the channels.
    pub fn purge(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.store.purge();
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ring(span: TimeRange) -> MultiChannelRing {
        let channels = vec![ChannelInfo::new("A", 256.0), ChannelInfo::new("B", 100.0)];
        MultiChannelRing::new(&channels, span, BackingKind::Memory).unwrap()
    }

    #[test]
    fn test_time_to_samples_at_256hz() {
        let r = ring(TimeRange::new(0, 2_000_000));
        assert_eq!(r.capacity("A"), Some(512));
        assert_eq!(r.capacity("B"), Some(200));

        let one_sec = r.read(&names(&["A"]), TimeRange::new(0, 1_000_000)).unwrap();
        assert_eq!(one_sec["A"].len(), 256);
        let half_sec = r.read(&names(&["A"]), TimeRange::new(0, 500_000)).unwrap();
        assert_eq!(half_sec["A"].len(), 128);
    }

    #[test]
    fn test_write_read_by_time() {
        let mut r = ring(TimeRange::new(1_000_000, 2_000_000));
        let values: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let written = r
            .write("B", TimeRange::new(1_500_000, 2_000_000), &values)
            .unwrap();
        assert_eq!(written, 50);

        let out = r
            .read(&names(&["B"]), TimeRange::new(1_500_000, 1_600_000))
            .unwrap();
        assert_eq!(out["B"], (0..10).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_read_outside_span_is_empty() {
        let r = ring(TimeRange::new(0, 1_000_000));
        let out = r
            .read(&names(&["A", "Z"]), TimeRange::new(900_000, 1_100_000))
            .unwrap();
        assert!(out["A"].is_empty());
        assert!(out["Z"].is_empty());
    }

    #[test]
    fn test_write_outside_span_is_range_error() {
        let mut r = ring(TimeRange::new(0, 1_000_000));
        let err = r
            .write("A", TimeRange::new(500_000, 1_500_000), &[1.0])
            .unwrap_err();
        assert!(matches!(err, BufferError::Range(_)));
        assert!(matches!(
            r.write("Z", TimeRange::new(0, 10), &[1.0]),
            Err(BufferError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_roll_shifts_per_channel_sample_counts() {
        let mut r = ring(TimeRange::new(0, 1_000_000));
        let a: Vec<f64> = (0..256).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..100).map(|i| i as f64).collect();
        r.write("A", TimeRange::new(0, 1_000_000), &a).unwrap();
        r.write("B", TimeRange::new(0, 1_000_000), &b).unwrap();

        r.roll(250_000).unwrap();
        assert_eq!(r.span("A"), Some(TimeRange::new(250_000, 1_250_000)));
        assert_eq!(r.span("B"), Some(TimeRange::new(250_000, 1_250_000)));

        let out = r
            .read(&names(&["A", "B"]), TimeRange::new(250_000, 260_000))
            .unwrap();
        // A rolled by 64 samples, B by 25
        assert_eq!(out["A"][0], 64.0);
        assert_eq!(out["B"][0], 25.0);
    }

    #[test]
    fn test_enlarge_and_shrink_move_span_edges() {
        let mut r = ring(TimeRange::new(1_000_000, 2_000_000));
        let b: Vec<f64> = (0..100).map(|i| i as f64 + 1.0).collect();
        r.write("B", TimeRange::new(1_000_000, 2_000_000), &b).unwrap();

        r.enlarge(1_000_000, 0.75).unwrap();
        assert_eq!(r.span("B"), Some(TimeRange::new(750_000, 2_750_000)));
        assert_eq!(r.capacity("B"), Some(200));
        let out = r
            .read(&names(&["B"]), TimeRange::new(1_000_000, 1_050_000))
            .unwrap();
        assert_eq!(out["B"], vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        r.shrink(1_000_000, 0.75).unwrap();
        assert_eq!(r.span("B"), Some(TimeRange::new(1_000_000, 2_000_000)));
        let out = r
            .read(&names(&["B"]), TimeRange::new(1_000_000, 2_000_000))
            .unwrap();
        assert_eq!(out["B"], b);
    }

    #[test]
    fn test_repeated_zooms_keep_capacity_matching_span() {
        // 256 Hz: one sample is 3906.25 us, so no step below is sample aligned
        let mut r = ring(TimeRange::new(0, 2_000_000));
        let steps = [
            (true, 1_000, 0.5),
            (true, 5_859, 0.8),
            (false, 7_001, 0.3),
            (true, 123_457, 1.0),
            (false, 2_001, 0.0),
            (false, 99_999, 0.5),
            (true, 1_953, 0.25),
        ];
        for _ in 0..20 {
            for &(grow, by, fb) in &steps {
                if grow {
                    r.enlarge(by, fb).unwrap();
                } else {
                    r.shrink(by, fb).unwrap();
                }
                for name in ["A", "B"] {
                    let span = r.span(name).unwrap();
                    let fs = if name == "A" { 256.0 } else { 100.0 };
                    assert_eq!(r.capacity(name), Some(samples_in(span.len(), fs)));
                }
            }
        }
        assert_eq!(r.span("A"), r.span("B"));
    }

    #[test]
    fn test_sub_sample_enlarge_still_tracks_span() {
        let mut r = ring(TimeRange::new(0, 1_000_000));
        // 1000 us is a quarter sample at 256 Hz
        for _ in 0..4 {
            r.enlarge(1_000, 1.0).unwrap();
        }
        assert_eq!(r.span("A"), Some(TimeRange::new(0, 1_004_000)));
        assert_eq!(r.capacity("A"), Some(257));
        assert_eq!(r.capacity("B"), Some(100));
    }

    #[test]
    fn test_extent_and_purge() {
        let mut r = ring(TimeRange::new(0, 3_000_000));
        assert_eq!(r.extent(), Some(TimeRange::new(0, 3_000_000)));
        r.purge();
        assert_eq!(r.extent(), None);
        assert!(r.channels().is_empty());
    }
}
