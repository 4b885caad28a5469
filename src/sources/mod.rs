// src/sources/mod.rs
//
// Data source abstraction: anything that can describe a recording and return
// per-channel samples for a channel set and time range.
// The buffer core only depends on this trait.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::types::{time_to_index, ChannelInfo, ChannelSamples, RecordingInfo, TimeRange, US_PER_SEC};

mod client;
mod file;
mod memory;

pub use client::ClientSource;
pub use file::FileSource;
pub use memory::MemorySource;

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Recording bounds and per-channel metadata.
    fn recording_info(&self) -> &RecordingInfo;

    /// Source type for logs
    fn kind(&self) -> &'static str;

    /// Whether `get_data` can answer `range` for `channels` right now.
    /// Sources that read on demand are always available.
    fn is_available(&self, _channels: &[String], _range: &TimeRange) -> bool {
        true
    }

    /// Samples covering `range` for every requested channel, in time order.
    /// Samples inside a recorded discontinuity are NaN.
    async fn get_data(
        &self,
        channels: &[String],
        range: TimeRange,
    ) -> Result<ChannelSamples, SourceError>;
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Index range of `range` in a channel's samples counted from recording start,
/// clipped to `[0, available)`.
pub(crate) fn source_index_range(
    info: &ChannelInfo,
    recording_start: i64,
    range: &TimeRange,
    available: usize,
) -> (usize, usize) {
    let available = available as i64;
    let i = time_to_index(range.start, recording_start, info.fs).clamp(0, available);
    let j = time_to_index(range.end, recording_start, info.fs).clamp(i, available);
    (i as usize, j as usize)
}

/// Replace samples that fall inside a discontinuity with NaN.
/// `first_index` is the recording-relative index of `values[0]`.
pub(crate) fn mask_gaps(
    info: &ChannelInfo,
    recording_start: i64,
    first_index: usize,
    values: &mut [f64],
) {
    if info.discontinuities.is_empty() {
        return;
    }
    for (k, v) in values.iter_mut().enumerate() {
        let t = recording_start
            + (((first_index + k) as f64) * US_PER_SEC / info.fs).round() as i64;
        if info.in_gap(t) {
            *v = f64::NAN;
        }
    }
}

/// Look up every requested channel, failing on the first unknown name.
pub(crate) fn resolve_channels<'a>(
    info: &'a RecordingInfo,
    channels: &[String],
) -> Result<Vec<&'a ChannelInfo>, SourceError> {
    channels
        .iter()
        .map(|name| {
            info.channel(name)
                .ok_or_else(|| SourceError::UnknownChannel(name.clone()))
        })
        .collect()
}
