// src/coordinator/mod.rs
//
// Background fill/roll loop for one ring instance.
//
// The coordinator is the only routine writer of the ring. It grows the loaded
// window chunk by chunk until it spans the ring extent (Filling), then rolls
// the ring to keep the view centred (Steady). Source calls never happen under
// the ring lock: the request is planned under the lock, fetched without it,
// and written back under the lock only if nothing moved in between.

mod control;
mod monitor;

pub use control::{CoordinatorControl, CoordinatorHandle, CoordinatorState};
pub use monitor::{run_monitor, BufferEvent};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ring::MultiChannelRing;
use crate::sources::DataSource;
use crate::types::{ChannelSamples, TimeRange};
use crate::window_map::ChannelWindowMap;

// ============================================================================
// Shared ring state
// ============================================================================

/// Everything guarded by the ring lock.
pub struct RingState {
    pub ring: MultiChannelRing,
    pub windows: ChannelWindowMap,
    /// Time span of one fetch, in microseconds
    pub chunk_size: i64,
    /// Last view reported by the UI
    pub view: TimeRange,
    /// Set by an in-place resize; the next fetch result is discarded
    pub size_changed: bool,
}

/// Single lock over a ring and its window map. Every mutation and every read
/// takes this lock for the duration of the call only.
#[derive(Clone)]
pub struct SharedRingHandle {
    inner: Arc<Mutex<RingState>>,
}

impl SharedRingHandle {
    pub fn new(state: RingState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RingState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut RingState) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub n_chunks_before: i64,
    pub n_chunks_after: i64,
    pub idle_poll: Duration,
    pub retry_backoff: Duration,
}

/// Direction of a planned fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Edge {
    Forward,
    Backward,
}

/// A fetch planned under the lock and validated again before writing.
#[derive(Clone, Debug)]
struct FetchPlan {
    channels: Vec<String>,
    request: TimeRange,
    /// Loaded window when the plan was made
    loaded: TimeRange,
    /// Ring roll applied with the write (Steady only)
    roll_by: i64,
    edge: Edge,
}

enum StepOutcome {
    /// Nothing to do; sleep before the next look
    Idle,
    /// Wrote or discarded something; iterate again immediately
    Progress,
    SourceFailed,
}

pub struct BufferCoordinator {
    source: Arc<dyn DataSource>,
    shared: SharedRingHandle,
    control: CoordinatorControl,
    config: CoordinatorConfig,
    recording: TimeRange,
}

impl BufferCoordinator {
    pub fn new(
        source: Arc<dyn DataSource>,
        shared: SharedRingHandle,
        control: CoordinatorControl,
        config: CoordinatorConfig,
    ) -> Self {
        let recording = source.recording_info().bounds();
        Self {
            source,
            shared,
            control,
            config,
            recording,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        tlog!(
            "[Coordinator] Started ({} source, recording {}, {}+1+{} chunks)",
            self.source.kind(),
            self.recording,
            self.config.n_chunks_before,
            self.config.n_chunks_after
        );
        self.control.set_state(CoordinatorState::Filling);

        while !self.control.is_cancelled() {
            match self.step().await {
                StepOutcome::Progress => tokio::task::yield_now().await,
                StepOutcome::Idle => tokio::time::sleep(self.config.idle_poll).await,
                StepOutcome::SourceFailed => tokio::time::sleep(self.config.retry_backoff).await,
            }
        }

        self.control.set_state(CoordinatorState::Stopped);
        tlog!("[Coordinator] Stopped");
    }

    async fn step(&self) -> StepOutcome {
        let plans = {
            let state = self.shared.lock();
            self.plan(&state)
        };
        if plans.is_empty() {
            return StepOutcome::Idle;
        }

        for plan in plans {
            if self.control.is_cancelled() {
                return StepOutcome::Progress;
            }

            let result = self.source.get_data(&plan.channels, plan.request).await;
            let samples = match result {
                Ok(samples) => samples,
                Err(e) => {
                    tlog!(
                        "[Coordinator] Source failed for {}: {} (will retry)",
                        plan.request,
                        e
                    );
                    return StepOutcome::SourceFailed;
                }
            };

            // Stopped while the fetch was in flight: drop the result
            if self.control.is_cancelled() {
                return StepOutcome::Progress;
            }

            let mut state = self.shared.lock();
            if !self.accept(&mut state, &plan) {
                self.control.note_discard();
                return StepOutcome::Progress;
            }
            self.apply(&mut state, &plan, &samples);
        }
        StepOutcome::Progress
    }

    /// Decide what to fetch next. Empty when there is nothing to do.
    fn plan(&self, state: &RingState) -> Vec<FetchPlan> {
        let channels = state.windows.active_channels();
        if channels.is_empty() {
            return Vec::new();
        }
        let (Some(loaded), Some(extent)) = (state.windows.largest_span(), state.ring.extent())
        else {
            return Vec::new();
        };
        let chunk = state.chunk_size.max(1);
        let bounds = match extent.intersect(&self.recording) {
            Some(b) => b,
            None => return Vec::new(),
        };

        if loaded.len() < bounds.len() {
            self.control.set_state(CoordinatorState::Filling);
            return self.plan_fill(channels, loaded, bounds, chunk);
        }

        self.control.set_state(CoordinatorState::Steady);
        self.plan_roll(channels, loaded, state.view, chunk)
            .into_iter()
            .collect()
    }

    /// One chunk forward from the leading edge, then one backward from the
    /// trailing edge, both clipped to the recording and the ring extent.
    fn plan_fill(
        &self,
        channels: Vec<String>,
        loaded: TimeRange,
        bounds: TimeRange,
        chunk: i64,
    ) -> Vec<FetchPlan> {
        let mut plans = Vec::with_capacity(2);

        let forward = TimeRange::new(loaded.end, loaded.end + chunk);
        if let Some(request) = forward.intersect(&bounds) {
            plans.push(FetchPlan {
                channels: channels.clone(),
                request,
                loaded,
                roll_by: 0,
                edge: Edge::Forward,
            });
        }

        let backward = TimeRange::new(loaded.start - chunk, loaded.start);
        if let Some(request) = backward.intersect(&bounds) {
            // Forward fetch moves the loaded end; validation only looks at the start
            plans.push(FetchPlan {
                channels,
                request,
                loaded,
                roll_by: 0,
                edge: Edge::Backward,
            });
        }

        plans
    }

    /// Roll toward the view when its midpoint has left the non-rolling zone
    /// (the chunk after the first `n_chunks_before` chunks).
    fn plan_roll(
        &self,
        channels: Vec<String>,
        loaded: TimeRange,
        view: TimeRange,
        chunk: i64,
    ) -> Option<FetchPlan> {
        let zone_start = loaded.start + self.config.n_chunks_before * chunk;
        let zone = TimeRange::new(zone_start, zone_start + chunk);
        let drift = view.midpoint() - zone.midpoint();

        if drift > 0 {
            let by = drift.min(self.recording.end - loaded.end);
            if by <= 0 {
                return None;
            }
            let request = TimeRange::new(loaded.end.max(loaded.start + by), loaded.end + by);
            Some(FetchPlan {
                channels,
                request,
                loaded,
                roll_by: by,
                edge: Edge::Forward,
            })
        } else if drift < 0 {
            let by = drift.max(self.recording.start - loaded.start);
            if by >= 0 {
                return None;
            }
            let request = TimeRange::new(loaded.start + by, loaded.start.min(loaded.end + by));
            Some(FetchPlan {
                channels,
                request,
                loaded,
                roll_by: by,
                edge: Edge::Backward,
            })
        } else {
            None
        }
    }

    /// Whether a completed fetch still matches the ring it was planned for.
    fn accept(&self, state: &mut RingState, plan: &FetchPlan) -> bool {
        if state.size_changed {
            state.size_changed = false;
            return false;
        }
        if state.windows.active_channels() != plan.channels {
            return false;
        }
        let Some(now) = state.windows.largest_span() else {
            return false;
        };
        match (plan.edge, plan.roll_by) {
            (Edge::Forward, 0) => now.end == plan.loaded.end,
            (Edge::Backward, 0) => now.start == plan.loaded.start,
            _ => now == plan.loaded,
        }
    }

    fn apply(&self, state: &mut RingState, plan: &FetchPlan, samples: &ChannelSamples) {
        if plan.roll_by != 0 {
            if let Err(e) = state.ring.roll(plan.roll_by) {
                tlog!("[Coordinator] Roll by {} failed: {}", plan.roll_by, e);
                return;
            }
            state.windows.shift(plan.roll_by);
        }

        for (name, values) in samples {
            if let Err(e) = state.ring.write(name, plan.request, values) {
                tlog!(
                    "[Coordinator] Write {} for '{}' failed: {}",
                    plan.request,
                    name,
                    e
                );
            }
        }

        if plan.roll_by == 0 {
            match plan.edge {
                Edge::Forward => state.windows.set_stop(plan.request.end),
                Edge::Backward => state.windows.set_start(plan.request.start),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::BackingKind;
    use crate::sources::MemorySource;
    use crate::types::{ChannelInfo, RecordingInfo};

    const SEC: i64 = 1_000_000;

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::ramp(RecordingInfo {
            recording_start: 0,
            recording_end: 10 * SEC,
            channels: vec![ChannelInfo::new("A", 100.0)],
        }))
    }

    fn shared(extent: TimeRange, anchor: i64, view: TimeRange) -> SharedRingHandle {
        let info = vec![ChannelInfo::new("A", 100.0)];
        let ring = MultiChannelRing::new(&info, extent, BackingKind::Memory).unwrap();
        let mut windows = ChannelWindowMap::new(&["A"]);
        windows.reset(&["A".to_string()], anchor);
        SharedRingHandle::new(RingState {
            ring,
            windows,
            chunk_size: SEC,
            view,
            size_changed: false,
        })
    }

    fn coordinator(src: Arc<MemorySource>, shared: SharedRingHandle) -> BufferCoordinator {
        BufferCoordinator::new(
            src,
            shared,
            CoordinatorControl::new(),
            CoordinatorConfig {
                n_chunks_before: 1,
                n_chunks_after: 1,
                idle_poll: Duration::from_millis(1),
                retry_backoff: Duration::from_millis(1),
            },
        )
    }

    async fn run_until_idle(coord: &BufferCoordinator) {
        for _ in 0..100 {
            if let StepOutcome::Idle = coord.step().await {
                return;
            }
        }
        panic!("coordinator never went idle");
    }

    #[tokio::test]
    async fn test_fill_reaches_extent() {
        let src = source();
        let handle = shared(TimeRange::new(3 * SEC, 6 * SEC), 4 * SEC, TimeRange::new(4 * SEC, 5 * SEC));
        let coord = coordinator(src.clone(), handle.clone());

        run_until_idle(&coord).await;

        let state = handle.lock();
        assert_eq!(state.windows.window("A"), Some(TimeRange::new(3 * SEC, 6 * SEC)));
        let out = state
            .ring
            .read(&["A".to_string()], TimeRange::new(3 * SEC, 3 * SEC + 30_000))
            .unwrap();
        assert_eq!(out["A"], vec![300.0, 301.0, 302.0]);
        assert_eq!(coord.control.state(), CoordinatorState::Steady);

        // First fetch goes forward from the view start
        assert_eq!(src.calls()[0].range, TimeRange::new(4 * SEC, 5 * SEC));
    }

    #[tokio::test]
    async fn test_fill_clamps_to_recording_start() {
        let src = source();
        // Extent sticks out before the recording
        let handle = shared(TimeRange::new(-SEC, 2 * SEC), 0, TimeRange::new(0, SEC));
        let coord = coordinator(src.clone(), handle.clone());

        run_until_idle(&coord).await;

        for call in src.calls() {
            assert!(call.range.start >= 0, "fetch {} before recording start", call.range);
        }
        assert_eq!(handle.lock().windows.window("A"), Some(TimeRange::new(0, 2 * SEC)));
    }

    #[tokio::test]
    async fn test_steady_rolls_toward_view() {
        let src = source();
        let handle = shared(TimeRange::new(3 * SEC, 6 * SEC), 4 * SEC, TimeRange::new(4 * SEC, 5 * SEC));
        let coord = coordinator(src.clone(), handle.clone());
        run_until_idle(&coord).await;

        src.clear_calls();
        handle.with(|s| s.view = TimeRange::new(4_900_000, 5_900_000));
        run_until_idle(&coord).await;

        let calls = src.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].range, TimeRange::new(6 * SEC, 6_900_000));

        let state = handle.lock();
        assert_eq!(state.windows.window("A"), Some(TimeRange::new(3_900_000, 6_900_000)));
        let out = state
            .ring
            .read(&["A".to_string()], TimeRange::new(6_880_000, 6_900_000))
            .unwrap();
        assert_eq!(out["A"], vec![688.0, 689.0]);
        let out = state
            .ring
            .read(&["A".to_string()], TimeRange::new(3_900_000, 3_920_000))
            .unwrap();
        assert_eq!(out["A"], vec![390.0, 391.0]);
    }

    #[tokio::test]
    async fn test_roll_stops_at_recording_end() {
        let src = source();
        let handle = shared(TimeRange::new(7 * SEC, 10 * SEC), 8 * SEC, TimeRange::new(8 * SEC, 9 * SEC));
        let coord = coordinator(src.clone(), handle.clone());
        run_until_idle(&coord).await;

        src.clear_calls();
        handle.with(|s| s.view = TimeRange::new(9 * SEC, 10 * SEC));
        run_until_idle(&coord).await;

        assert!(src.calls().is_empty());
        assert_eq!(handle.lock().windows.window("A"), Some(TimeRange::new(7 * SEC, 10 * SEC)));
    }

    #[tokio::test]
    async fn test_size_changed_discards_fetch() {
        let src = source();
        let handle = shared(TimeRange::new(3 * SEC, 6 * SEC), 4 * SEC, TimeRange::new(4 * SEC, 5 * SEC));
        let coord = coordinator(src.clone(), handle.clone());

        handle.with(|s| s.size_changed = true);
        assert!(matches!(coord.step().await, StepOutcome::Progress));

        assert_eq!(coord.control.discarded_fetches(), 1);
        assert!(!handle.lock().size_changed);
        assert_eq!(handle.lock().windows.window("A"), Some(TimeRange::at(4 * SEC)));
    }

    #[tokio::test]
    async fn test_source_failure_is_retried() {
        let src = source();
        src.fail_next(1);
        let handle = shared(TimeRange::new(3 * SEC, 6 * SEC), 4 * SEC, TimeRange::new(4 * SEC, 5 * SEC));
        let coord = coordinator(src.clone(), handle.clone());

        assert!(matches!(coord.step().await, StepOutcome::SourceFailed));
        run_until_idle(&coord).await;
        assert_eq!(handle.lock().windows.window("A"), Some(TimeRange::new(3 * SEC, 6 * SEC)));
    }

    #[tokio::test]
    async fn test_stop_waits_for_fetch_and_drops_it() {
        let src = Arc::new(
            MemorySource::ramp(RecordingInfo {
                recording_start: 0,
                recording_end: 10 * SEC,
                channels: vec![ChannelInfo::new("A", 100.0)],
            })
            .with_latency(Duration::from_millis(200)),
        );
        let handle = shared(TimeRange::new(3 * SEC, 6 * SEC), 4 * SEC, TimeRange::new(4 * SEC, 5 * SEC));
        let coord = coordinator(src.clone(), handle.clone());
        let control = coord.control.clone();

        let started = std::time::Instant::now();
        let task = tokio::spawn(coord.run());
        while src.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        control.cancel();
        task.await.unwrap();

        // Join returned only after the in-flight fetch completed
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(src.calls().len(), 1);
        assert_eq!(handle.lock().windows.window("A"), Some(TimeRange::at(4 * SEC)));
        assert_eq!(control.state(), CoordinatorState::Stopped);
    }

    /// xorshift64 so the stress test needs no RNG crate
    fn next_rand(state: &mut u64) -> u64 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        x
    }

    /// Rewrite the whole span so sample i holds its absolute sample number.
    fn stamp(state: &mut RingState) {
        let span = state.ring.span("A").unwrap();
        let first = span.start / 1_000;
        let n = state.ring.capacity("A").unwrap() as i64;
        let values: Vec<f64> = (first..first + n).map(|k| k as f64).collect();
        state.ring.write("A", span, &values).unwrap();
    }

    #[test]
    fn test_concurrent_mutation_and_reads() {
        // 1 kHz: one sample per millisecond keeps every op sample-aligned
        let info = vec![ChannelInfo::new("A", 1000.0)];
        let ring =
            MultiChannelRing::new(&info, TimeRange::new(0, 500_000), BackingKind::Memory).unwrap();
        let handle = SharedRingHandle::new(RingState {
            ring,
            windows: ChannelWindowMap::new(&["A"]),
            chunk_size: SEC,
            view: TimeRange::new(0, SEC),
            size_changed: false,
        });
        handle.with(stamp);

        let writer_handle = handle.clone();
        let writer = std::thread::spawn(move || {
            let mut rng = 0x9E37_79B9_7F4A_7C15u64;
            for _ in 0..10_000 {
                let r = next_rand(&mut rng);
                let ms = (r % 200 + 1) as i64 * 2;
                let fb = [0.0, 0.5, 1.0][(r >> 32) as usize % 3];
                let mut state = writer_handle.lock();
                let cap = state.ring.capacity("A").unwrap() as i64;
                match (r >> 16) % 4 {
                    0 => state.ring.roll(ms * 1_000).unwrap(),
                    1 => state.ring.roll(-ms * 1_000).unwrap(),
                    2 if cap + ms <= 2_000 => state.ring.enlarge(ms * 1_000, fb).unwrap(),
                    _ if cap - ms >= 10 => state.ring.shrink(ms * 1_000, fb).unwrap(),
                    _ => state.ring.roll(ms * 1_000).unwrap(),
                }
                stamp(&mut state);
            }
        });

        let reader_handle = handle.clone();
        let reader = std::thread::spawn(move || {
            let mut rng = 0xD1B5_4A32_D192_ED03u64;
            for _ in 0..10_000 {
                let r = next_rand(&mut rng);
                let state = reader_handle.lock();
                let span = state.ring.span("A").unwrap();
                let cap = state.ring.capacity("A").unwrap() as u64;
                let i = (r % cap) as i64;
                let j = i + ((r >> 20) % (cap - i as u64) + 1) as i64;
                let range = TimeRange::new(span.start + i * 1_000, span.start + j * 1_000);
                let out = state.ring.read(&["A".to_string()], range).unwrap();
                let first = span.start / 1_000 + i;
                let expected: Vec<f64> = (first..first + (j - i)).map(|k| k as f64).collect();
                assert_eq!(out["A"], expected, "torn read for {}", range);
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[tokio::test]
    async fn test_no_active_channels_idles() {
        let src = source();
        let handle = shared(TimeRange::new(3 * SEC, 6 * SEC), 4 * SEC, TimeRange::new(4 * SEC, 5 * SEC));
        handle.with(|s| s.windows.deactivate_all());
        let coord = coordinator(src.clone(), handle);

        assert!(matches!(coord.step().await, StepOutcome::Idle));
        assert!(src.calls().is_empty());
    }
}
