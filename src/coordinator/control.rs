// src/coordinator/control.rs
//
// Control flags shared between the facade and the background tasks, and the
// handle that owns those tasks' join handles.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fill/roll loop phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Loaded window is smaller than the ring extent
    Filling,
    /// Window at full size; rolling to follow the view
    Steady,
    Stopped,
}

impl CoordinatorState {
    fn to_u8(self) -> u8 {
        match self {
            CoordinatorState::Filling => 0,
            CoordinatorState::Steady => 1,
            CoordinatorState::Stopped => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => CoordinatorState::Filling,
            1 => CoordinatorState::Steady,
            _ => CoordinatorState::Stopped,
        }
    }
}

/// Cooperative control for one coordinator instance. Cheap to clone; all
/// clones share the same flags.
#[derive(Clone, Debug)]
pub struct CoordinatorControl {
    /// Set to true to stop the loop and the monitor
    pub cancel_flag: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    /// Fetch results thrown away because the ring changed while they were in flight
    discarded: Arc<AtomicU64>,
}

impl CoordinatorControl {
    pub fn new() -> Self {
        Self {
            cancel_flag: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(CoordinatorState::Filling.to_u8())),
            discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Signal cancellation
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: CoordinatorState) {
        self.state.store(state.to_u8(), Ordering::Relaxed);
    }

    pub(crate) fn note_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_fetches(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl Default for CoordinatorControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Running coordinator + monitor pair.
pub struct CoordinatorHandle {
    pub control: CoordinatorControl,
    coordinator: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn new(control: CoordinatorControl, coordinator: JoinHandle<()>, monitor: JoinHandle<()>) -> Self {
        Self {
            control,
            coordinator: Some(coordinator),
            monitor: Some(monitor),
        }
    }

    pub fn is_running(&self) -> bool {
        self.coordinator
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Cancel both tasks and wait for them to exit. Storage may be released
    /// once this returns.
    pub async fn stop(&mut self) {
        self.control.cancel();
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }
        self.control.set_state(CoordinatorState::Stopped);
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        // Tasks observe the flag and exit on their own
        self.control.cancel();
    }
}
