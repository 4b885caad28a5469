// src/coordinator/monitor.rs
//
// Watches the loaded-window bookkeeping and broadcasts a StateChanged event
// whenever it moves, so the UI can redraw without polling the ring.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{CoordinatorControl, SharedRingHandle};
use crate::window_map::LoadedWindow;

/// Events delivered to facade subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BufferEvent {
    /// Loaded windows changed (fill progress, roll or resize)
    StateChanged { windows: Vec<LoadedWindow> },
    /// Ring was torn down and rebuilt for a new channel set or view
    Restarted { channels: Vec<String> },
}

/// Poll the window map every `interval` until cancelled.
pub async fn run_monitor(
    shared: SharedRingHandle,
    control: CoordinatorControl,
    interval: Duration,
    events: broadcast::Sender<BufferEvent>,
) {
    let mut last: Option<Vec<LoadedWindow>> = None;

    while !control.is_cancelled() {
        let snapshot = shared.lock().windows.snapshot();
        if last.as_ref() != Some(&snapshot) {
            // No subscribers is fine
            let _ = events.send(BufferEvent::StateChanged {
                windows: snapshot.clone(),
            });
            last = Some(snapshot);
        }
        tokio::time::sleep(interval).await;
    }
}
