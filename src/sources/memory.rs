// src/sources/memory.rs
//
// In-memory recording: per-channel sample arrays held in RAM.
// Supports an artificial per-call latency, injected failures and a call log,
// which makes it the reference source for exercising the buffer.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{mask_gaps, resolve_channels, source_index_range, DataSource};
use crate::error::SourceError;
use crate::types::{samples_in, ChannelSamples, RecordingInfo, TimeRange};

/// One `get_data` call as seen by the source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceCall {
    pub channels: Vec<String>,
    pub range: TimeRange,
}

pub struct MemorySource {
    info: RecordingInfo,
    data: BTreeMap<String, Vec<f64>>,
    latency: Option<Duration>,
    failures_pending: AtomicUsize,
    calls: Mutex<Vec<SourceCall>>,
}

impl MemorySource {
    /// Source over explicit arrays. Sample 0 of each array is at `recording_start`.
    pub fn new(info: RecordingInfo, data: BTreeMap<String, Vec<f64>>) -> Self {
        Self {
            info,
            data,
            latency: None,
            failures_pending: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Source whose sample k of every channel has value k.
    pub fn ramp(info: RecordingInfo) -> Self {
        let data = info
            .channels
            .iter()
            .map(|ch| {
                let n = samples_in(info.duration(), ch.fs);
                (ch.name.clone(), (0..n).map(|k| k as f64).collect())
            })
            .collect();
        Self::new(info, data)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` calls fail with `SourceError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Every call served so far, including failed ones.
    pub fn calls(&self) -> Vec<SourceCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn recording_info(&self) -> &RecordingInfo {
        &self.info
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get_data(
        &self,
        channels: &[String],
        range: TimeRange,
    ) -> Result<ChannelSamples, SourceError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SourceCall {
                channels: channels.to_vec(),
                range,
            });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.take_failure() {
            return Err(SourceError::Unavailable(format!(
                "injected failure for {}",
                range
            )));
        }

        let mut out = ChannelSamples::new();
        for ch in resolve_channels(&self.info, channels)? {
            let samples = self
                .data
                .get(&ch.name)
                .ok_or_else(|| SourceError::UnknownChannel(ch.name.clone()))?;
            let (i, j) = source_index_range(ch, self.info.recording_start, &range, samples.len());
            let mut values = samples[i..j].to_vec();
            mask_gaps(ch, self.info.recording_start, i, &mut values);
            out.insert(ch.name.clone(), values);
        }
        Ok(out)
    }
}
