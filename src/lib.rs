// src/lib.rs
//
// Sliding-window multi-channel ring-buffer cache for long recordings.
// A background coordinator keeps a per-channel circular buffer filled around
// the visible time range; the facade serves reads and view changes.

#[macro_use]
mod logging;

pub mod coordinator;
pub mod error;
pub mod facade;
pub mod ring;
pub mod settings;
pub mod sources;
pub mod spill_db;
pub mod store;
pub mod types;
pub mod window_map;

pub use coordinator::{BufferEvent, CoordinatorState, SharedRingHandle};
pub use error::{BufferError, SourceError};
pub use facade::{BufferFacade, ViewChange};
pub use logging::{
    file_logging_enabled, init_file_logging, init_from_settings, prune_old_logs, stop_file_logging,
};
pub use ring::{BackingKind, MultiChannelRing};
pub use settings::{load_settings, save_settings, BufferSettings};
pub use sources::{ClientSource, DataSource, FileSource, MemorySource};
pub use spill_db::purge_stale_spill_files;
pub use store::CircularChannelStore;
pub use types::{ChannelInfo, ChannelSamples, RecordingInfo, TimeRange};
pub use window_map::{ChannelWindowMap, LoadedWindow};
