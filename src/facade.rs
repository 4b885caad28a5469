// src/facade.rs
//
// Consumer-facing buffer API.
// Turns view changes into the smallest ring operation (bookkeeping, in-place
// resize or full restart), serves reads of buffered samples with a bounded
// wait, and forwards loaded-window changes to subscribers.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::coordinator::{
    run_monitor, BufferCoordinator, BufferEvent, CoordinatorConfig, CoordinatorControl,
    CoordinatorHandle, CoordinatorState, RingState, SharedRingHandle,
};
use crate::error::{BufferError, SourceError};
use crate::ring::{BackingKind, MultiChannelRing};
use crate::settings::BufferSettings;
use crate::sources::DataSource;
use crate::spill_db::purge_stale_spill_files;
use crate::types::{ChannelInfo, ChannelSamples, RecordingInfo, TimeRange};
use crate::window_map::{ChannelWindowMap, LoadedWindow};

const EVENT_CAPACITY: usize = 256;

/// How a view change was applied.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewChange {
    /// Ring torn down and rebuilt around the new view
    Restarted,
    /// Ring grown in place; `by` is in microseconds
    Enlarged { by: i64, fb_ratio: f64 },
    /// Ring shrunk in place; `by` is in microseconds
    Shrunk { by: i64, fb_ratio: f64 },
    /// View moved inside the loaded window; the coordinator rolls as needed
    Panned,
}

pub struct BufferFacade {
    source: Arc<dyn DataSource>,
    settings: BufferSettings,
    shared: SharedRingHandle,
    tasks: Option<CoordinatorHandle>,
    events: broadcast::Sender<BufferEvent>,
    /// Active channel set in recording order
    channels: Vec<String>,
    closed: bool,
}

impl BufferFacade {
    /// Wrap `source` and start an idle coordinator anchored at the recording start.
    /// Must be called from within a tokio runtime.
    pub async fn open(
        source: Arc<dyn DataSource>,
        settings: BufferSettings,
    ) -> Result<Self, BufferError> {
        settings.validate()?;
        crate::logging::init_from_settings(&settings)?;

        let info = source.recording_info();
        if info.recording_end <= info.recording_start {
            return Err(BufferError::range(format!(
                "recording {} is empty",
                info.bounds()
            )));
        }

        if settings.use_disk_buffer {
            purge_stale_spill_files(&settings.spill_dir)?;
        }

        let names: Vec<&str> = info.channels.iter().map(|c| c.name.as_str()).collect();
        let shared = SharedRingHandle::new(RingState {
            ring: MultiChannelRing::empty(backing_kind(&settings)),
            windows: ChannelWindowMap::new(&names),
            chunk_size: settings.chunk_size_us(),
            view: TimeRange::at(info.recording_start),
            size_changed: false,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tlog!(
            "[Facade] Opened {} source: {} channels, recording {}, chunk {} us, disk={}",
            source.kind(),
            info.channels.len(),
            info.bounds(),
            settings.chunk_size_us(),
            settings.use_disk_buffer
        );

        let start = info.recording_start;
        let mut facade = Self {
            source,
            settings,
            shared,
            tasks: None,
            events,
            channels: Vec::new(),
            closed: false,
        };
        let chunk = facade.settings.chunk_size_us();
        facade
            .restart(Vec::new(), TimeRange::new(start, start + chunk))
            .await?;
        Ok(facade)
    }

    pub fn recording_info(&self) -> &RecordingInfo {
        self.source.recording_info()
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.tasks
            .as_ref()
            .map(|t| t.control.state())
            .unwrap_or(CoordinatorState::Stopped)
    }

    /// Fetch results discarded by the current coordinator after concurrent resizes.
    pub fn discarded_fetches(&self) -> u64 {
        self.tasks
            .as_ref()
            .map(|t| t.control.discarded_fetches())
            .unwrap_or(0)
    }

    pub fn active_channels(&self) -> &[String] {
        &self.channels
    }

    /// Per-channel loaded windows, for a navigation bar.
    pub fn loaded_windows(&self) -> Vec<LoadedWindow> {
        self.shared.lock().windows.snapshot()
    }

    pub fn chunk_size(&self) -> i64 {
        self.shared.lock().chunk_size
    }

    fn ensure_open(&self) -> Result<(), BufferError> {
        if self.closed {
            Err(BufferError::Closed)
        } else {
            Ok(())
        }
    }

    /// Requested names in recording order, rejecting unknown ones.
    fn normalize_channels(&self, requested: &[String]) -> Result<Vec<String>, BufferError> {
        let info = self.source.recording_info();
        if let Some(unknown) = requested.iter().find(|n| info.channel(n).is_none()) {
            return Err(BufferError::UnknownChannel(unknown.clone()));
        }
        Ok(info
            .channels
            .iter()
            .filter(|c| requested.contains(&c.name))
            .map(|c| c.name.clone())
            .collect())
    }

    /// Ring extent for a view starting at `view_start`: `n_chunks_before`
    /// chunks before, the view chunk and `n_chunks_after` chunks after,
    /// shifted inward at the recording bounds.
    fn desired_extent(&self, view_start: i64, chunk: i64) -> TimeRange {
        let rec = self.source.recording_info().bounds();
        let before = self.settings.n_chunks_before as i64 * chunk;
        let after = (self.settings.n_chunks_after as i64 + 1) * chunk;
        if before + after >= rec.len() {
            return rec;
        }

        let mut start = view_start - before;
        let mut end = view_start + after;
        if start < rec.start {
            end += rec.start - start;
            start = rec.start;
        }
        if end > rec.end {
            start -= end - rec.end;
            end = rec.end;
        }
        TimeRange::new(start, end)
    }

    // ========================================================================
    // View changes
    // ========================================================================

    /// Apply a new visible channel set and time range.
    pub async fn on_view_changed(
        &mut self,
        channels: &[String],
        view: TimeRange,
    ) -> Result<ViewChange, BufferError> {
        self.ensure_open()?;
        if view.is_empty() {
            return Err(BufferError::range(format!("empty view {}", view)));
        }
        let channels = self.normalize_channels(channels)?;

        // Channel set changed
        if channels != self.channels {
            tlog!(
                "[Facade] Channel set changed ({} -> {}), restarting",
                self.channels.len(),
                channels.len()
            );
            self.restart(channels, view).await?;
            return Ok(ViewChange::Restarted);
        }

        let width = view.len();
        let (chunk_size, loaded) = {
            let state = self.shared.lock();
            (state.chunk_size, state.windows.largest_span())
        };
        let in_buffer = loaded.map(|w| w.contains_range(&view)).unwrap_or(false);

        // Span width changed
        if width != chunk_size {
            if !in_buffer {
                tlog!("[Facade] Zoom to {} outside loaded window, restarting", view);
                self.restart(channels, view).await?;
                return Ok(ViewChange::Restarted);
            }
            return self.resize(view);
        }

        // Pure pan
        if !in_buffer {
            tlog!("[Facade] Pan to {} outside loaded window, restarting", view);
            self.restart(channels, view).await?;
            return Ok(ViewChange::Restarted);
        }
        self.shared.with(|s| s.view = view);
        Ok(ViewChange::Panned)
    }

    /// Resize the ring in place so it holds the configured number of chunks
    /// of the new view width.
    fn resize(&mut self, view: TimeRange) -> Result<ViewChange, BufferError> {
        let width = view.len();
        let target = self.desired_extent(view.start, width);

        let mut state = self.shared.lock();
        let Some(current) = state.ring.extent() else {
            state.chunk_size = width;
            state.view = view;
            return Ok(ViewChange::Panned);
        };

        // Share of the change at the later edge vs the earlier edge, measured
        // on the ring extent since the loaded window may still be filling
        let front = current.end - target.end;
        let back = target.start - current.start;
        let fb_ratio = if front + back == 0 {
            0.5
        } else {
            (front as f64 / (front + back) as f64).clamp(0.0, 1.0)
        };

        let diff = target.len() - current.len();
        let change = if diff < 0 {
            state.ring.shrink(-diff, fb_ratio)?;
            if let Some(extent) = state.ring.extent() {
                state.windows.clamp_to(extent);
            }
            ViewChange::Shrunk { by: -diff, fb_ratio }
        } else if diff > 0 {
            state.ring.enlarge(diff, fb_ratio)?;
            ViewChange::Enlarged { by: diff, fb_ratio }
        } else {
            ViewChange::Panned
        };

        state.size_changed = true;
        state.chunk_size = width;
        state.view = view;
        drop(state);

        tlog!(
            "[Facade] Resized for view {} ({:?}, fb_ratio {:.3})",
            view,
            change,
            fb_ratio
        );
        Ok(change)
    }

    /// Stop the background tasks, release the old ring and build a new one
    /// around `view`. The view width becomes the chunk size.
    async fn restart(&mut self, channels: Vec<String>, view: TimeRange) -> Result<(), BufferError> {
        if let Some(mut tasks) = self.tasks.take() {
            tasks.stop().await;
        }

        let chunk = view.len();
        self.shared.with(|state| {
            state.ring.purge();
            state.windows.deactivate_all();
            state.view = view;
            state.chunk_size = chunk;
            state.size_changed = false;
        });

        let extent = self.desired_extent(view.start, chunk);
        let infos: Vec<ChannelInfo> = channels
            .iter()
            .filter_map(|name| self.source.recording_info().channel(name).cloned())
            .collect();
        let ring = MultiChannelRing::new(&infos, extent, backing_kind(&self.settings))?;

        {
            let mut state = self.shared.lock();
            state.ring = ring;
            state.windows.reset(&channels, extent.clamp_time(view.start));
        }
        self.channels = channels.clone();
        self.spawn_tasks();

        tlog!(
            "[Facade] Restarted: {} channel(s), view {}, extent {}",
            channels.len(),
            view,
            extent
        );
        let _ = self.events.send(BufferEvent::Restarted { channels });
        Ok(())
    }

    fn spawn_tasks(&mut self) {
        let control = CoordinatorControl::new();
        let config = CoordinatorConfig {
            n_chunks_before: self.settings.n_chunks_before as i64,
            n_chunks_after: self.settings.n_chunks_after as i64,
            idle_poll: self.settings.idle_poll(),
            retry_backoff: self.settings.retry_backoff(),
        };
        let coordinator = BufferCoordinator::new(
            Arc::clone(&self.source),
            self.shared.clone(),
            control.clone(),
            config,
        );

        let coordinator_task = tokio::spawn(coordinator.run());
        let monitor_task = tokio::spawn(run_monitor(
            self.shared.clone(),
            control.clone(),
            self.settings.monitor_interval(),
            self.events.clone(),
        ));
        self.tasks = Some(CoordinatorHandle::new(control, coordinator_task, monitor_task));
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Whether `range` is resident for every channel in `channels`.
    pub fn is_available(&self, channels: &[String], range: &TimeRange) -> bool {
        !self.closed && self.shared.lock().windows.is_available(channels, range)
    }

    /// Buffered samples if `range` is already resident, `None` otherwise.
    pub fn try_get_data(
        &self,
        range: TimeRange,
        channels: &[String],
    ) -> Result<Option<ChannelSamples>, BufferError> {
        self.ensure_open()?;
        let state = self.shared.lock();
        if !state.windows.is_available(channels, &range) {
            return Ok(None);
        }
        state.ring.read(channels, range).map(Some)
    }

    /// Buffered samples for `range`, waiting up to the configured read timeout
    /// for the coordinator to load them.
    pub async fn get_data(
        &self,
        range: TimeRange,
        channels: &[String],
    ) -> Result<ChannelSamples, BufferError> {
        self.ensure_open()?;
        self.normalize_channels(channels)?;

        let timeout = self.settings.read_timeout();
        let poll = self.settings.read_poll();
        let wait = async {
            loop {
                match self.try_get_data(range, channels) {
                    Ok(Some(data)) => return Ok(data),
                    Ok(None) => tokio::time::sleep(poll).await,
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BufferError::ReadTimeout {
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop background tasks and release all ring storage, deleting spill files.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(mut tasks) = self.tasks.take() {
            tasks.stop().await;
        }
        self.shared.with(|s| {
            s.ring.purge();
            s.windows.deactivate_all();
        });
        self.channels.clear();
        self.closed = true;
        tlog!("[Facade] Closed");
    }
}

fn backing_kind(settings: &BufferSettings) -> BackingKind {
    if settings.use_disk_buffer {
        BackingKind::Disk {
            spill_dir: settings.spill_dir.clone(),
        }
    } else {
        BackingKind::Memory
    }
}

/// The buffer is itself a data source: it serves the wrapped source's
/// recording from the ring.
#[async_trait]
impl DataSource for BufferFacade {
    fn recording_info(&self) -> &RecordingInfo {
        self.source.recording_info()
    }

    fn kind(&self) -> &'static str {
        "buffered"
    }

    fn is_available(&self, channels: &[String], range: &TimeRange) -> bool {
        BufferFacade::is_available(self, channels, range)
    }

    async fn get_data(
        &self,
        channels: &[String],
        range: TimeRange,
    ) -> Result<ChannelSamples, SourceError> {
        BufferFacade::get_data(self, range, channels)
            .await
            .map_err(|e| match e {
                BufferError::SourceUnavailable(inner) => inner,
                BufferError::UnknownChannel(name) => SourceError::UnknownChannel(name),
                other => SourceError::Unavailable(other.to_string()),
            })
    }
}
