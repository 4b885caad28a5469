// src/store.rs
//
// Circular sample store for a single channel.
// Logical index i maps to physical slot (rotation + i) % capacity, so a roll
// only moves the rotation offset. Enlarge/shrink rewrite the backing in place
// and keep the retained samples in time order.

use std::path::Path;

use crate::error::BufferError;
use crate::spill_db::SpillArray;
use crate::types::split_by_ratio;

// ============================================================================
// Backing storage
// ============================================================================

/// Physical sample array behind a circular store.
pub trait SampleBacking: Send {
    fn len(&self) -> usize;
    fn read(&self, pos: usize, n: usize) -> Result<Vec<f64>, BufferError>;
    fn write(&mut self, pos: usize, values: &[f64]) -> Result<(), BufferError>;
    /// Insert `n` zeros before physical position `at`.
    fn insert_zeros(&mut self, at: usize, n: usize) -> Result<(), BufferError>;
    /// Keep `keep_len` samples of the logical sequence starting at physical
    /// `rotation`, from logical `keep_from`, laid out from physical 0.
    fn compact(&mut self, rotation: usize, keep_from: usize, keep_len: usize)
        -> Result<(), BufferError>;
    fn purge(&mut self);
    fn is_disk(&self) -> bool {
        false
    }
}

/// RAM-resident backing.
#[derive(Default)]
pub struct MemoryBacking {
    samples: Vec<f64>,
}

impl MemoryBacking {
    pub fn zeroed(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
        }
    }
}

impl SampleBacking for MemoryBacking {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn read(&self, pos: usize, n: usize) -> Result<Vec<f64>, BufferError> {
        self.samples
            .get(pos..pos + n)
            .map(|s| s.to_vec())
            .ok_or_else(|| {
                BufferError::range(format!(
                    "read [{}, {}) beyond length {}",
                    pos,
                    pos + n,
                    self.samples.len()
                ))
            })
    }

    fn write(&mut self, pos: usize, values: &[f64]) -> Result<(), BufferError> {
        let len = self.samples.len();
        let slot = self.samples.get_mut(pos..pos + values.len()).ok_or_else(|| {
            BufferError::range(format!(
                "write [{}, {}) beyond length {}",
                pos,
                pos + values.len(),
                len
            ))
        })?;
        slot.copy_from_slice(values);
        Ok(())
    }

    fn insert_zeros(&mut self, at: usize, n: usize) -> Result<(), BufferError> {
        if at > self.samples.len() {
            return Err(BufferError::range(format!(
                "insert at {} beyond length {}",
                at,
                self.samples.len()
            )));
        }
        self.samples
            .splice(at..at, std::iter::repeat(0.0).take(n));
        Ok(())
    }

    fn compact(
        &mut self,
        rotation: usize,
        keep_from: usize,
        keep_len: usize,
    ) -> Result<(), BufferError> {
        let len = self.samples.len();
        if keep_from + keep_len > len {
            return Err(BufferError::range(format!(
                "compact [{}, {}) beyond length {}",
                keep_from,
                keep_from + keep_len,
                len
            )));
        }
        if len > 0 {
            self.samples.rotate_left(rotation % len);
        }
        self.samples.drain(..keep_from);
        self.samples.truncate(keep_len);
        Ok(())
    }

    fn purge(&mut self) {
        self.samples = Vec::new();
    }
}

impl SampleBacking for SpillArray {
    fn len(&self) -> usize {
        SpillArray::len(self)
    }

    fn read(&self, pos: usize, n: usize) -> Result<Vec<f64>, BufferError> {
        SpillArray::read(self, pos, n)
    }

    fn write(&mut self, pos: usize, values: &[f64]) -> Result<(), BufferError> {
        SpillArray::write(self, pos, values)
    }

    fn insert_zeros(&mut self, at: usize, n: usize) -> Result<(), BufferError> {
        SpillArray::insert_zeros(self, at, n)
    }

    fn compact(
        &mut self,
        rotation: usize,
        keep_from: usize,
        keep_len: usize,
    ) -> Result<(), BufferError> {
        SpillArray::compact(self, rotation, keep_from, keep_len)
    }

    fn purge(&mut self) {
        SpillArray::purge(self)
    }

    fn is_disk(&self) -> bool {
        true
    }
}

// ============================================================================
// Circular store
// ============================================================================

pub struct CircularChannelStore {
    backing: Box<dyn SampleBacking>,
    rotation: usize,
}

impl CircularChannelStore {
    pub fn new(backing: Box<dyn SampleBacking>) -> Self {
        Self {
            backing,
            rotation: 0,
        }
    }

    /// Zero-filled in-memory store.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Box::new(MemoryBacking::zeroed(capacity)))
    }

    /// Zero-filled store spilled to a SQLite file in `spill_dir`.
    pub fn on_disk(spill_dir: &Path, capacity: usize) -> Result<Self, BufferError> {
        Ok(Self::new(Box::new(SpillArray::create(spill_dir, capacity)?)))
    }

    pub fn capacity(&self) -> usize {
        self.backing.len()
    }

    pub fn rotation(&self) -> usize {
        self.rotation
    }

    pub fn is_disk_backed(&self) -> bool {
        self.backing.is_disk()
    }

    fn check_range(&self, start: usize, end: usize, op: &str) -> Result<(), BufferError> {
        if start > end || end > self.capacity() {
            return Err(BufferError::range(format!(
                "{} [{}, {}) outside capacity {}",
                op,
                start,
                end,
                self.capacity()
            )));
        }
        Ok(())
    }

    /// Samples at logical `[start, end)` in time order, stitched across the wrap.
    pub fn read(&self, start: usize, end: usize) -> Result<Vec<f64>, BufferError> {
        self.check_range(start, end, "read")?;
        let n = end - start;
        if n == 0 {
            return Ok(Vec::new());
        }

        let cap = self.capacity();
        let pos = (self.rotation + start) % cap;
        let first = n.min(cap - pos);

        let mut out = self.backing.read(pos, first)?;
        if first < n {
            out.extend(self.backing.read(0, n - first)?);
        }
        Ok(out)
    }

    /// Overwrite logical `[start, start + values.len())`.
    pub fn write(&mut self, start: usize, values: &[f64]) -> Result<(), BufferError> {
        let end = start + values.len();
        self.check_range(start, end, "write")?;
        if values.is_empty() {
            return Ok(());
        }

        let cap = self.capacity();
        let pos = (self.rotation + start) % cap;
        let first = values.len().min(cap - pos);

        self.backing.write(pos, &values[..first])?;
        if first < values.len() {
            self.backing.write(0, &values[first..])?;
        }
        Ok(())
    }

    /// Shift the logical origin by `by` samples. Positive drops the oldest
    /// samples and exposes stale slots at the end.
    pub fn roll(&mut self, by: i64) {
        let cap = self.capacity() as i64;
        if cap == 0 {
            return;
        }
        self.rotation = (self.rotation as i64 + by).rem_euclid(cap) as usize;
    }

    /// Grow by `by` zero samples: `fb_ratio` of them at the end, the rest at the start.
    pub fn enlarge(&mut self, by: i64, fb_ratio: f64) -> Result<(), BufferError> {
        if by <= 0 {
            return Err(BufferError::range(format!("enlarge by {} samples", by)));
        }
        let (back, front) = split_by_ratio(by, fb_ratio);
        self.enlarge_edges(back as usize, front as usize)
    }

    /// Grow by `back` zero samples before logical index 0 and `front` after the last.
    pub fn enlarge_edges(&mut self, back: usize, front: usize) -> Result<(), BufferError> {
        let by = back + front;
        if by == 0 {
            return Ok(());
        }

        // Zeros land between the logical tail and head
        self.backing.insert_zeros(self.rotation, by)?;
        self.rotation = (self.rotation + by - back) % self.capacity();
        Ok(())
    }

    /// Drop `by` samples: `fb_ratio` of them from the end, the rest from the start.
    pub fn shrink(&mut self, by: i64, fb_ratio: f64) -> Result<(), BufferError> {
        if by <= 0 || by as usize > self.capacity() {
            return Err(BufferError::range(format!(
                "shrink by {} samples with capacity {}",
                by,
                self.capacity()
            )));
        }
        let (back, front) = split_by_ratio(by, fb_ratio);
        self.shrink_edges(back as usize, front as usize)
    }

    /// Drop `back` samples from the start and `front` from the end.
    pub fn shrink_edges(&mut self, back: usize, front: usize) -> Result<(), BufferError> {
        let cap = self.capacity();
        let by = back + front;
        if by > cap {
            return Err(BufferError::range(format!(
                "shrink by {}+{} samples with capacity {}",
                back, front, cap
            )));
        }
        if by == 0 {
            return Ok(());
        }

        self.backing.compact(self.rotation, back, cap - by)?;
        self.rotation = 0;
        Ok(())
    }

    /// Release all samples. Disk-backed stores delete their spill file.
    pub fn purge(&mut self) {
        self.backing.purge();
        self.rotation = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(cap: usize) -> CircularChannelStore {
        let mut store = CircularChannelStore::in_memory(cap);
        let values: Vec<f64> = (0..cap).map(|i| i as f64).collect();
        store.write(0, &values).unwrap();
        store
    }

    #[test]
    fn test_round_trip_across_wrap() {
        let mut store = filled(10);
        store.roll(7);
        // Logical [2, 6) covers physical 9, 0, 1, 2
        store.write(2, &[100.0, 101.0, 102.0, 103.0]).unwrap();
        assert_eq!(store.read(2, 6).unwrap(), vec![100.0, 101.0, 102.0, 103.0]);
        assert_eq!(store.read(0, 2).unwrap(), vec![7.0, 8.0]);
    }

    #[test]
    fn test_roll_and_back_restores_content() {
        let mut store = filled(12);
        let before = store.read(0, 12).unwrap();
        for k in [1i64, 5, 11, -3, -11] {
            store.roll(k);
            store.roll(-k);
            assert_eq!(store.read(0, 12).unwrap(), before);
            assert_eq!(store.rotation(), 0);
        }
    }

    #[test]
    fn test_roll_forward_drops_oldest() {
        let mut store = filled(5);
        store.roll(2);
        assert_eq!(store.read(0, 3).unwrap(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_enlarge_splits_zeros() {
        let mut store = filled(4);
        store.roll(1);
        store.enlarge(4, 0.25).unwrap();
        assert_eq!(store.capacity(), 8);
        assert_eq!(
            store.read(0, 8).unwrap(),
            vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_enlarge_then_shrink_restores_order() {
        for rotation in 0..6i64 {
            for ratio in [0.0, 0.3, 0.5, 1.0] {
                let mut store = filled(6);
                store.roll(rotation);
                let before = store.read(0, 6).unwrap();
                store.enlarge(5, ratio).unwrap();
                store.shrink(5, ratio).unwrap();
                assert_eq!(store.read(0, 6).unwrap(), before);
            }
        }
    }

    #[test]
    fn test_shrink_keeps_middle() {
        let mut store = filled(10);
        store.roll(4);
        // Logical order is 4..10, 0..4; drop 2 from the start and 1 from the end
        store.shrink(3, 1.0 / 3.0).unwrap();
        assert_eq!(
            store.read(0, 7).unwrap(),
            vec![6.0, 7.0, 8.0, 9.0, 0.0, 1.0, 2.0]
        );
    }

    #[test]
    fn test_edge_counts_resize_each_side() {
        let mut store = filled(4);
        store.roll(2);
        store.enlarge_edges(1, 2).unwrap();
        assert_eq!(
            store.read(0, 7).unwrap(),
            vec![0.0, 2.0, 3.0, 0.0, 1.0, 0.0, 0.0]
        );

        store.shrink_edges(2, 1).unwrap();
        assert_eq!(store.read(0, 4).unwrap(), vec![3.0, 0.0, 1.0, 0.0]);

        store.enlarge_edges(0, 0).unwrap();
        assert_eq!(store.capacity(), 4);
        assert!(matches!(store.shrink_edges(3, 2), Err(BufferError::Range(_))));
    }

    #[test]
    fn test_range_errors() {
        let mut store = filled(4);
        assert!(matches!(store.read(2, 5), Err(BufferError::Range(_))));
        assert!(matches!(store.write(3, &[1.0, 2.0]), Err(BufferError::Range(_))));
        assert!(matches!(store.enlarge(0, 0.5), Err(BufferError::Range(_))));
        assert!(matches!(store.shrink(-1, 0.5), Err(BufferError::Range(_))));
        assert!(matches!(store.shrink(5, 0.5), Err(BufferError::Range(_))));
    }

    #[test]
    fn test_purge_releases_memory() {
        let mut store = filled(4);
        store.purge();
        assert_eq!(store.capacity(), 0);
        assert_eq!(store.read(0, 0).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_disk_store_matches_memory_store() {
        let dir = std::env::temp_dir().join(format!("sigview-store-{}", uuid::Uuid::new_v4()));
        let mut disk = CircularChannelStore::on_disk(&dir, 8).unwrap();
        let mut mem = CircularChannelStore::in_memory(8);
        assert!(disk.is_disk_backed());

        let values: Vec<f64> = (0..8).map(|i| i as f64 * 1.5).collect();
        for store in [&mut disk, &mut mem] {
            store.write(0, &values).unwrap();
            store.roll(5);
            store.write(6, &[-1.0, -2.0]).unwrap();
            store.enlarge(3, 0.5).unwrap();
            store.roll(-2);
            store.shrink(4, 0.75).unwrap();
        }
        assert_eq!(disk.capacity(), mem.capacity());
        assert_eq!(
            disk.read(0, disk.capacity()).unwrap(),
            mem.read(0, mem.capacity()).unwrap()
        );

        disk.purge();
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
