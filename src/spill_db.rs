// src/spill_db.rs
//
// SQLite-backed storage for disk-resident channel stores.
// One spill file per channel store: a `samples` table keyed by physical
// position, so the circular store above can address it like an array
// without holding the samples in RAM.
//
// Spill files are ephemeral. They are deleted on purge/drop and every live
// file is tracked so leftovers from a crashed session can be cleaned up.

use once_cell::sync::Lazy;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::BufferError;

/// File name prefix for every spill database.
pub const SPILL_FILE_PREFIX: &str = "sigview-spill-";

/// Spill files currently owned by a live store.
static SPILL_FILES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS samples (
    pos INTEGER PRIMARY KEY,
    value REAL NOT NULL
);
";

// ============================================================================
// Registry
// ============================================================================

fn register(path: &Path) {
    SPILL_FILES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path.to_path_buf());
}

fn unregister(path: &Path) {
    SPILL_FILES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(path);
}

/// Paths of spill files owned by live stores.
pub fn live_spill_files() -> Vec<PathBuf> {
    SPILL_FILES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect()
}

/// Delete spill files in `dir` that no live store owns (e.g. left behind by a crash).
/// Returns the number of database files removed.
pub fn purge_stale_spill_files(dir: &Path) -> Result<usize, BufferError> {
    if !dir.exists() {
        return Ok(0);
    }

    let live: HashSet<PathBuf> = live_spill_files().into_iter().collect();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| BufferError::Storage(format!("Failed to read spill dir: {}", e)))?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SPILL_FILE_PREFIX) || !name.ends_with(".db") {
            continue;
        }
        if live.contains(&path) {
            continue;
        }
        remove_db_files(&path);
        removed += 1;
    }

    if removed > 0 {
        tlog!("[SpillDb] Removed {} stale spill file(s) from {:?}", removed, dir);
    }
    Ok(removed)
}

/// Remove a database file and its WAL side files.
fn remove_db_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(side));
    }
}

// ============================================================================
// Spill array
// ============================================================================

/// Fixed-length array of f64 samples stored in a private SQLite file.
/// Positions are physical (0..len); the circular mapping lives one layer up.
pub struct SpillArray {
    conn: Option<Connection>,
    path: PathBuf,
    len: usize,
}

impl SpillArray {
    /// Create a zero-filled spill array of `len` samples in `dir`.
    pub fn create(dir: &Path, len: usize) -> Result<Self, BufferError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| BufferError::Storage(format!("Failed to create spill dir: {}", e)))?;

        let path = dir.join(format!("{}{}.db", SPILL_FILE_PREFIX, uuid::Uuid::new_v4()));
        let conn = Connection::open(&path)
            .map_err(|e| BufferError::Storage(format!("Failed to open spill file: {}", e)))?;

        // WAL mode for cheap appends; NORMAL sync is enough for best-effort spill
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch("PRAGMA temp_store=MEMORY;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        register(&path);

        let mut array = Self {
            conn: Some(conn),
            path,
            len: 0,
        };
        array.insert_zeros(0, len)?;

        tlog!("[SpillDb] Created spill file {:?} ({} samples)", array.path, len);
        Ok(array)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<&Connection, BufferError> {
        self.conn
            .as_ref()
            .ok_or_else(|| BufferError::Storage("Spill file has been purged".to_string()))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, BufferError> {
        self.conn
            .as_mut()
            .ok_or_else(|| BufferError::Storage("Spill file has been purged".to_string()))
    }

    /// Read `n` samples starting at physical position `pos`.
    pub fn read(&self, pos: usize, n: usize) -> Result<Vec<f64>, BufferError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if pos + n > self.len {
            return Err(BufferError::range(format!(
                "spill read [{}, {}) beyond length {}",
                pos,
                pos + n,
                self.len
            )));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT value FROM samples WHERE pos >= ?1 AND pos < ?2 ORDER BY pos",
        )?;
        let rows = stmt.query_map(params![pos as i64, (pos + n) as i64], |row| {
            row.get::<_, f64>(0)
        })?;

        let mut values = Vec::with_capacity(n);
        for row in rows {
            values.push(row?);
        }

        if values.len() != n {
            return Err(BufferError::Storage(format!(
                "Spill file returned {} of {} samples",
                values.len(),
                n
            )));
        }
        Ok(values)
    }

    /// Overwrite samples starting at physical position `pos`. Uses a single
    /// transaction, committed before returning.
    pub fn write(&mut self, pos: usize, values: &[f64]) -> Result<(), BufferError> {
        if values.is_empty() {
            return Ok(());
        }
        if pos + values.len() > self.len {
            return Err(BufferError::range(format!(
                "spill write [{}, {}) beyond length {}",
                pos,
                pos + values.len(),
                self.len
            )));
        }

        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("UPDATE samples SET value = ?2 WHERE pos = ?1")?;
            for (i, v) in values.iter().enumerate() {
                stmt.execute(params![(pos + i) as i64, v])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert `n` zero samples before physical position `at`, shifting the tail up.
    pub fn insert_zeros(&mut self, at: usize, n: usize) -> Result<(), BufferError> {
        if n == 0 {
            return Ok(());
        }
        if at > self.len {
            return Err(BufferError::range(format!(
                "spill insert at {} beyond length {}",
                at, self.len
            )));
        }

        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        // Move the tail through negative keys so the primary key never collides
        tx.execute(
            "UPDATE samples SET pos = -(pos + ?2) - 1 WHERE pos >= ?1",
            params![at as i64, n as i64],
        )?;
        tx.execute("UPDATE samples SET pos = -pos - 1 WHERE pos < 0", [])?;
        tx.execute(
            "WITH RECURSIVE seq(x) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT x + 1 FROM seq WHERE x + 1 < ?2
             )
             INSERT INTO samples (pos, value) SELECT x, 0.0 FROM seq",
            params![at as i64, (at + n) as i64],
        )?;
        tx.commit()?;

        self.len += n;
        Ok(())
    }

    /// Keep `keep_len` samples of the logical sequence that starts at physical
    /// `rotation`, beginning at logical index `keep_from`. The kept samples are
    /// renumbered to physical 0.. in logical order; everything else is dropped.
    pub fn compact(
        &mut self,
        rotation: usize,
        keep_from: usize,
        keep_len: usize,
    ) -> Result<(), BufferError> {
        if keep_from + keep_len > self.len {
            return Err(BufferError::range(format!(
                "spill compact [{}, {}) beyond length {}",
                keep_from,
                keep_from + keep_len,
                self.len
            )));
        }
        if self.len == 0 {
            return Ok(());
        }

        let len = self.len as i64;
        let rotation = rotation as i64 % len;
        let keep_from = keep_from as i64;
        let keep_to = keep_from + keep_len as i64;

        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM samples
             WHERE ((pos - ?1 + ?2) % ?2) < ?3 OR ((pos - ?1 + ?2) % ?2) >= ?4",
            params![rotation, len, keep_from, keep_to],
        )?;
        tx.execute(
            "UPDATE samples SET pos = -(((pos - ?1 + ?2) % ?2) - ?3) - 1",
            params![rotation, len, keep_from],
        )?;
        tx.execute("UPDATE samples SET pos = -pos - 1 WHERE pos < 0", [])?;
        tx.commit()?;

        self.len = keep_len;
        Ok(())
    }

    /// Close the connection and delete the spill file.
    pub fn purge(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            remove_db_files(&self.path);
            unregister(&self.path);
            tlog!("[SpillDb] Deleted spill file {:?}", self.path);
        }
        self.len = 0;
    }

    pub fn is_purged(&self) -> bool {
        self.conn.is_none()
    }
}

impl Drop for SpillArray {
    fn drop(&mut self) {
        self.purge();
    }
}
