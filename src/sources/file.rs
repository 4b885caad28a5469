// src/sources/file.rs
//
// Recording stored in a SQLite file.
// Tables: `recording` (bounds), `channels` (name, rate, unit), `samples`
// (per-channel positional values) and `discontinuities` (per-channel gaps).
// Queries run on the blocking pool so async callers never stall on disk I/O.

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::{mask_gaps, resolve_channels, source_index_range, DataSource};
use crate::error::SourceError;
use crate::types::{ChannelInfo, ChannelSamples, RecordingInfo, TimeRange};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS recording (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    recording_start INTEGER NOT NULL,
    recording_end INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS channels (
    idx INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    fs REAL NOT NULL,
    unit TEXT NOT NULL DEFAULT '',
    ufact REAL NOT NULL DEFAULT 1.0,
    n_samples INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS samples (
    channel INTEGER NOT NULL,
    pos INTEGER NOT NULL,
    value REAL,
    PRIMARY KEY (channel, pos)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS discontinuities (
    channel INTEGER NOT NULL,
    start_us INTEGER NOT NULL,
    end_us INTEGER NOT NULL
);
";

struct ChannelRow {
    idx: i64,
    n_samples: usize,
}

pub struct FileSource {
    path: PathBuf,
    info: RecordingInfo,
    rows: Vec<ChannelRow>,
    conn: Arc<Mutex<Connection>>,
}

impl FileSource {
    /// Write a recording file. `data` holds each channel's samples from
    /// `recording_start`; an existing file at `path` is replaced.
    pub fn create(
        path: &Path,
        info: &RecordingInfo,
        data: &ChannelSamples,
    ) -> Result<Self, SourceError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO recording (id, recording_start, recording_end) VALUES (1, ?1, ?2)",
            params![info.recording_start, info.recording_end],
        )?;
        {
            let mut ch_stmt = tx.prepare_cached(
                "INSERT INTO channels (idx, name, fs, unit, ufact, n_samples)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut sample_stmt = tx.prepare_cached(
                "INSERT INTO samples (channel, pos, value) VALUES (?1, ?2, ?3)",
            )?;
            let mut gap_stmt = tx.prepare_cached(
                "INSERT INTO discontinuities (channel, start_us, end_us) VALUES (?1, ?2, ?3)",
            )?;

            for (idx, ch) in info.channels.iter().enumerate() {
                let samples = data.get(&ch.name).map(|v| v.as_slice()).unwrap_or(&[]);
                ch_stmt.execute(params![
                    idx as i64,
                    ch.name,
                    ch.fs,
                    ch.unit,
                    ch.ufact,
                    samples.len() as i64
                ])?;
                for (pos, value) in samples.iter().enumerate() {
                    sample_stmt.execute(params![idx as i64, pos as i64, value])?;
                }
                for gap in &ch.discontinuities {
                    gap_stmt.execute(params![idx as i64, gap.start, gap.end])?;
                }
            }
        }
        tx.commit()?;
        drop(conn);

        tlog!(
            "[FileSource] Wrote recording {:?} ({} channels)",
            path,
            info.channels.len()
        );
        Self::open(path)
    }

    /// Open an existing recording file read-only.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let (recording_start, recording_end) = conn.query_row(
            "SELECT recording_start, recording_end FROM recording WHERE id = 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut channels = Vec::new();
        let mut rows = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT idx, name, fs, unit, ufact, n_samples FROM channels ORDER BY idx",
            )?;
            let mut query = stmt.query([])?;
            while let Some(row) = query.next()? {
                let idx: i64 = row.get(0)?;
                let mut ch = ChannelInfo::new(row.get::<_, String>(1)?, row.get(2)?);
                ch.unit = row.get(3)?;
                ch.ufact = row.get(4)?;
                channels.push(ch);
                rows.push(ChannelRow {
                    idx,
                    n_samples: row.get::<_, i64>(5)?.max(0) as usize,
                });
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT start_us, end_us FROM discontinuities WHERE channel = ?1 ORDER BY start_us",
            )?;
            for (ch, row) in channels.iter_mut().zip(rows.iter()) {
                let gaps = stmt.query_map(params![row.idx], |r| {
                    Ok(TimeRange::new(r.get(0)?, r.get(1)?))
                })?;
                for gap in gaps {
                    ch.discontinuities.push(gap?);
                }
            }
        }

        if recording_end < recording_start {
            return Err(SourceError::Decode(format!(
                "recording end {} precedes start {}",
                recording_end, recording_start
            )));
        }

        tlog!(
            "[FileSource] Opened {:?}: {} channels, [{}, {})",
            path,
            channels.len(),
            recording_start,
            recording_end
        );

        Ok(Self {
            path: path.to_path_buf(),
            info: RecordingInfo {
                recording_start,
                recording_end,
                channels,
            },
            rows,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read `[i, j)` of one channel. Missing and NULL rows read back as NaN.
fn read_positions(
    conn: &Connection,
    channel: i64,
    i: usize,
    j: usize,
) -> Result<Vec<f64>, SourceError> {
    let mut values = vec![f64::NAN; j - i];
    let mut stmt = conn.prepare_cached(
        "SELECT pos, value FROM samples WHERE channel = ?1 AND pos >= ?2 AND pos < ?3",
    )?;
    let rows = stmt.query_map(params![channel, i as i64, j as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?))
    })?;
    for row in rows {
        let (pos, value) = row?;
        if let Some(slot) = values.get_mut((pos as usize).wrapping_sub(i)) {
            *slot = value.unwrap_or(f64::NAN);
        }
    }
    Ok(values)
}

#[async_trait]
impl DataSource for FileSource {
    fn recording_info(&self) -> &RecordingInfo {
        &self.info
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get_data(
        &self,
        channels: &[String],
        range: TimeRange,
    ) -> Result<ChannelSamples, SourceError> {
        let mut requests = Vec::with_capacity(channels.len());
        for ch in resolve_channels(&self.info, channels)? {
            let pos = self
                .info
                .channel_index(&ch.name)
                .ok_or_else(|| SourceError::UnknownChannel(ch.name.clone()))?;
            let row = &self.rows[pos];
            let (i, j) =
                source_index_range(ch, self.info.recording_start, &range, row.n_samples);
            requests.push((ch.clone(), row.idx, i, j));
        }

        let conn = Arc::clone(&self.conn);
        let recording_start = self.info.recording_start;
        tokio::task::spawn_blocking(move || -> Result<ChannelSamples, SourceError> {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let mut out = ChannelSamples::new();
            for (ch, idx, i, j) in requests {
                let mut values = read_positions(&conn, idx, i, j)?;
                mask_gaps(&ch, recording_start, i, &mut values);
                out.insert(ch.name, values);
            }
            Ok(out)
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("Read task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("sigview-file-{}", uuid::Uuid::new_v4()))
            .join("recording.db")
    }

    fn recording() -> (RecordingInfo, ChannelSamples) {
        let info = RecordingInfo {
            recording_start: 5_000_000,
            recording_end: 7_000_000,
            channels: vec![
                ChannelInfo::new("Fp1", 50.0).with_unit("uV", 0.5),
                ChannelInfo::new("Fp2", 20.0)
                    .with_discontinuity(TimeRange::new(6_000_000, 6_500_000)),
            ],
        };
        let mut data = ChannelSamples::new();
        data.insert("Fp1".into(), (0..100).map(|k| k as f64).collect());
        data.insert("Fp2".into(), (0..40).map(|k| -(k as f64)).collect());
        (info, data)
    }

    #[test]
    fn test_create_and_open_metadata() {
        let path = temp_file();
        let (info, data) = recording();
        FileSource::create(&path, &info, &data).unwrap();

        let src = FileSource::open(&path).unwrap();
        assert_eq!(src.recording_info(), &info);
        assert_eq!(src.kind(), "file");

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_data_by_time() {
        let path = temp_file();
        let (info, data) = recording();
        let src = FileSource::create(&path, &info, &data).unwrap();

        let out = src
            .get_data(
                &["Fp1".to_string(), "Fp2".to_string()],
                TimeRange::new(5_900_000, 6_600_000),
            )
            .await
            .unwrap();

        // Fp1 at 50 Hz: indices 45..80
        assert_eq!(out["Fp1"], (45..80).map(|k| k as f64).collect::<Vec<_>>());
        // Fp2 at 20 Hz: indices 18..32, gap covers 20..30
        assert_eq!(out["Fp2"].len(), 14);
        assert_eq!(out["Fp2"][0], -18.0);
        assert!(out["Fp2"][2].is_nan());
        assert!(out["Fp2"][11].is_nan());
        assert_eq!(out["Fp2"][12], -30.0);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_range_past_end_is_clipped() {
        let path = temp_file();
        let (info, data) = recording();
        let src = FileSource::create(&path, &info, &data).unwrap();

        let out = src
            .get_data(&["Fp1".to_string()], TimeRange::new(6_900_000, 9_000_000))
            .await
            .unwrap();
        assert_eq!(out["Fp1"], (95..100).map(|k| k as f64).collect::<Vec<_>>());

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
