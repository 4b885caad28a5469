// src/error.rs
//
// Error taxonomy for the buffer core and its data sources.
// Boundary clamping and stale-resize discards are normal control flow and
// never show up here.

use thiserror::Error;

/// Failures raised by a data source while serving metadata or samples.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Recording database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Data server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to decode source payload: {0}")]
    Decode(String),
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the ring buffer, coordinator and facade.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Caller asked for samples or a resize outside what the component guarantees.
    #[error("Range error: {0}")]
    Range(String),
    /// `get_data` waited longer than the configured bound for the range to load.
    #[error("Timed out after {waited_ms} ms waiting for buffered data")]
    ReadTimeout { waited_ms: u64 },
    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),
    /// Backing storage (spill file) failure.
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("Buffer has been closed")]
    Closed,
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for BufferError {
    fn from(e: rusqlite::Error) -> Self {
        BufferError::Storage(e.to_string())
    }
}

impl BufferError {
    pub(crate) fn range(msg: impl Into<String>) -> Self {
        BufferError::Range(msg.into())
    }

    /// Whether the caller may simply retry later (UI shows "loading").
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BufferError::ReadTimeout { .. } | BufferError::SourceUnavailable(_)
        )
    }
}
