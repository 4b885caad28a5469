// src/logging.rs
//
// Timestamped logging for the buffer core.
// Every message goes to stderr. When `log_to_file` is set, the facade also
// opens a timestamped file under `log_dir` and prunes old ones.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::BufferError;
use crate::settings::BufferSettings;

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

const LOG_SUFFIX: &str = "-sigview.log";
const LATEST_LINK: &str = "sigview.log";

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", chrono::Local::now().format("%H:%M:%S%.3f"), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}

fn now_hms() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Open a new timestamped log file in `log_dir` and route `tlog!` output to it.
/// On Unix a `sigview.log` symlink points at the newest file.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, BufferError> {
    std::fs::create_dir_all(log_dir).map_err(|e| {
        BufferError::Config(format!("log dir {}: {}", log_dir.display(), e))
    })?;

    let filename = format!("{}{}", chrono::Local::now().format("%Y%m%d-%H%M%S"), LOG_SUFFIX);
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| BufferError::Config(format!("log file {}: {}", log_path.display(), e)))?;

    // Windows symlinks require elevated privileges
    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("{} [Logging] Failed to link {}: {}", now_hms(), LATEST_LINK, e);
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // tlog! would lock LOG_FILE again here
    eprintln!("{} [Logging] File logging started: {}", now_hms(), log_path.display());
    Ok(log_path)
}

/// Start file logging as configured. Returns the new log path, or `None` when
/// file logging is off or a file is already attached.
pub fn init_from_settings(settings: &BufferSettings) -> Result<Option<PathBuf>, BufferError> {
    if !settings.log_to_file || file_logging_enabled() {
        return Ok(None);
    }
    let path = init_file_logging(&settings.log_dir)?;
    let removed = prune_old_logs(&settings.log_dir, settings.log_keep);
    if removed > 0 {
        tlog!("[Logging] Removed {} old log file(s)", removed);
    }
    Ok(Some(path))
}

/// Delete all but the `keep` newest timestamped log files in `log_dir`.
/// Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };
    let mut logs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(LOG_SUFFIX))
        .map(|e| e.path())
        .collect();
    if logs.len() <= keep {
        return 0;
    }

    // Timestamp prefix sorts chronologically
    logs.sort();
    let stale = logs.len() - keep;
    let mut removed = 0;
    for path in &logs[..stale] {
        if std::fs::remove_file(path).is_ok() {
            removed += 1;
        }
    }
    removed
}

pub fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.take().is_some() {
            eprintln!("{} [Logging] File logging stopped", now_hms());
        }
    }
}

pub fn file_logging_enabled() -> bool {
    LOG_FILE.lock().map(|g| g.is_some()).unwrap_or(false)
}
