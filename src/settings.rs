// src/settings.rs
//
// Buffer configuration: chunking, slack on each side of the view, disk spill,
// log files and the timing knobs of the background tasks. Stored as TOML or JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BufferError;
use crate::types::US_PER_SEC;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BufferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: f64, // seconds per fetch
    #[serde(default = "default_n_chunks")]
    pub n_chunks_before: u32,
    #[serde(default = "default_n_chunks")]
    pub n_chunks_after: u32,
    #[serde(default)]
    pub use_disk_buffer: bool,
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,

    // Log file output (stderr is always on)
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_keep")]
    pub log_keep: usize, // timestamped log files kept per directory

    // Background task timing
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_chunk_size() -> f64 {
    10.0
}
fn default_n_chunks() -> u32 {
    1
}
fn cache_base() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sigview")
}
fn default_spill_dir() -> PathBuf {
    cache_base().join("spill")
}
fn default_log_dir() -> PathBuf {
    cache_base().join("logs")
}
fn default_log_keep() -> usize {
    10
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_read_poll_ms() -> u64 {
    5
}
fn default_monitor_interval_ms() -> u64 {
    20
}
fn default_idle_poll_ms() -> u64 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    50
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            n_chunks_before: default_n_chunks(),
            n_chunks_after: default_n_chunks(),
            use_disk_buffer: false,
            spill_dir: default_spill_dir(),
            log_to_file: false,
            log_dir: default_log_dir(),
            log_keep: default_log_keep(),
            read_timeout_ms: default_read_timeout_ms(),
            read_poll_ms: default_read_poll_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl BufferSettings {
    /// Chunk size in uUTC microseconds.
    pub fn chunk_size_us(&self) -> i64 {
        (self.chunk_size * US_PER_SEC).round() as i64
    }

    /// Total chunks held by the ring: before + view + after.
    pub fn total_chunks(&self) -> i64 {
        self.n_chunks_before as i64 + self.n_chunks_after as i64 + 1
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), BufferError> {
        if !self.chunk_size.is_finite() || self.chunk_size_us() <= 0 {
            return Err(BufferError::Config(format!(
                "chunk_size must be positive, got {}",
                self.chunk_size
            )));
        }
        if self.read_timeout_ms == 0 {
            return Err(BufferError::Config(
                "read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.use_disk_buffer && self.spill_dir.as_os_str().is_empty() {
            return Err(BufferError::Config(
                "spill_dir is required when use_disk_buffer is set".to_string(),
            ));
        }
        if self.log_to_file && self.log_dir.as_os_str().is_empty() {
            return Err(BufferError::Config(
                "log_dir is required when log_to_file is set".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
}

/// Load settings from a `.toml` or `.json` file. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<BufferSettings, BufferError> {
    if !path.exists() {
        return Ok(BufferSettings::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| BufferError::Config(format!("Failed to read settings: {}", e)))?;

    let settings: BufferSettings = if is_json(path) {
        serde_json::from_str(&contents)
            .map_err(|e| BufferError::Config(format!("Failed to parse settings: {}", e)))?
    } else {
        toml::from_str(&contents)
            .map_err(|e| BufferError::Config(format!("Failed to parse settings: {}", e)))?
    };

    settings.validate()?;
    Ok(settings)
}

/// Save settings next to `path` and rename into place.
pub fn save_settings(path: &Path, settings: &BufferSettings) -> Result<(), BufferError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BufferError::Config(format!("Failed to create settings dir: {}", e)))?;
    }

    let contents = if is_json(path) {
        serde_json::to_string_pretty(settings)
            .map_err(|e| BufferError::Config(format!("Failed to serialise settings: {}", e)))?
    } else {
        toml::to_string_pretty(settings)
            .map_err(|e| BufferError::Config(format!("Failed to serialise settings: {}", e)))?
    };

    // Atomic write: write to temp file, then rename
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents)
        .map_err(|e| BufferError::Config(format!("Failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| BufferError::Config(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}
