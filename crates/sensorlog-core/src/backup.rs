//! Compressed point-in-time backups of the reading store.
//!
//! A backup is one gzip-compressed JSON document named
//! `YYYY-MM-DDTHHMMSSZ.json.gz` (UTC creation time). The series are captured
//! inside the store's write-intent window so no writer commits mid-capture;
//! compression and the file write happen after the window is released.
//! Every call also purges backups older than the retention window, judged by
//! the timestamp in the file name. Files with other names are left alone.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{format_iso8601_compact, parse_iso8601_compact, unix_now};
use crate::error::{Error, Result};
use crate::raw_state::{self, RawStateEntry, RawStateStore};
use crate::store::{self, SeriesSnapshot, TimeSeriesStore};

const BACKUP_SUFFIX: &str = ".json.gz";
const BACKUP_VERSION: u32 = 1;

/// Default number of days a backup is kept.
pub const DEFAULT_RETENTION_DAYS: u32 = 21;

/// Where backups go and how long they are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub retention_days: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/bak"),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Result of one backup call.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub path: PathBuf,
    pub series: usize,
    pub readings: usize,
    pub raw_state_keys: usize,
    pub purged: Vec<PathBuf>,
}

/// Result of restoring a backup into a data directory.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub created_at: i64,
    pub series: usize,
    pub readings: usize,
    pub raw_state_keys: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    version: u32,
    created_at: i64,
    series: Vec<SeriesSnapshot>,
    #[serde(default)]
    raw_state: Vec<RawStateEntry>,
}

impl TimeSeriesStore {
    /// Back up this store's readings. See [`backup`] to include raw state.
    pub fn backup(&self, config: &BackupConfig) -> Result<BackupReport> {
        backup(self, None, config)
    }
}

/// Write a backup of `store` (and optionally `raw_state`) into `config.dir`
/// and purge expired backups.
///
/// The store stays writable throughout except for the capture window.
pub fn backup(
    store: &TimeSeriesStore,
    raw_state: Option<&RawStateStore>,
    config: &BackupConfig,
) -> Result<BackupReport> {
    fs::create_dir_all(&config.dir)?;

    let series = store.with_write_intent(|tables| tables.snapshot())?;
    let raw_state = raw_state.map(RawStateStore::entries).unwrap_or_default();

    let now = unix_now();
    let document = BackupFile {
        version: BACKUP_VERSION,
        created_at: now,
        series,
        raw_state,
    };
    let readings = document.series.iter().map(|s| s.points.len()).sum();

    let path = config
        .dir
        .join(format!("{}{BACKUP_SUFFIX}", format_iso8601_compact(now)));
    let tmp = path.with_extension("gz.tmp");
    {
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&tmp)?), Compression::default());
        serde_json::to_writer(&mut encoder, &document)?;
        let mut inner = encoder.finish()?;
        inner.flush()?;
        inner.get_ref().sync_all()?;
    }
    fs::rename(&tmp, &path)?;

    let purged = purge_expired(&config.dir, config.retention_days, now)?;
    info!(
        "backup written to {} ({} series, {} readings, {} purged)",
        path.display(),
        document.series.len(),
        readings,
        purged.len()
    );
    Ok(BackupReport {
        path,
        series: document.series.len(),
        readings,
        raw_state_keys: document.raw_state.len(),
        purged,
    })
}

/// Remove backups whose file-name timestamp is older than `retention_days`.
pub fn purge_expired(dir: &Path, retention_days: u32, now: i64) -> Result<Vec<PathBuf>> {
    let cutoff = now - i64::from(retention_days) * 86_400;
    let mut purged = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stamp) = name.strip_suffix(BACKUP_SUFFIX) else {
            continue;
        };
        let Some(created) = parse_iso8601_compact(stamp) else {
            continue;
        };
        if created < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => purged.push(path),
                Err(e) => warn!("could not purge old backup {}: {e}", path.display()),
            }
        }
    }
    purged.sort();
    Ok(purged)
}

/// Rebuild the on-disk state in `data_dir` from a backup file.
///
/// The store must not be open on `data_dir` while this runs; the next
/// [`TimeSeriesStore::open`] picks the restored snapshot up.
pub fn restore(backup_path: &Path, data_dir: &Path) -> Result<RestoreReport> {
    let file = File::open(backup_path)?;
    let document: BackupFile = serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?;
    if document.version != BACKUP_VERSION {
        return Err(Error::StorageUnavailable {
            path: backup_path.display().to_string(),
            reason: format!("unsupported backup version {}", document.version),
        });
    }

    let report = RestoreReport {
        created_at: document.created_at,
        series: document.series.len(),
        readings: document.series.iter().map(|s| s.points.len()).sum(),
        raw_state_keys: document.raw_state.len(),
    };
    store::write_snapshot_file(data_dir, document.series)?;
    raw_state::write_journal(data_dir, &document.raw_state)?;
    info!(
        "restored {} series ({} readings) from {}",
        report.series,
        report.readings,
        backup_path.display()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;

    fn config_in(dir: &Path) -> BackupConfig {
        BackupConfig {
            dir: dir.join("bak"),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    #[test]
    fn test_backup_writes_named_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::open(tmp.path().join("data")).unwrap();
        store.insert("a", 1, 1.0);
        store.insert("a", 2, 2.0);
        store.insert("b", 3, 3.0);

        let report = store.backup(&config_in(tmp.path())).unwrap();
        assert!(report.path.exists());
        assert_eq!(report.series, 2);
        assert_eq!(report.readings, 3);

        let name = report.path.file_name().unwrap().to_str().unwrap();
        let stamp = name.strip_suffix(BACKUP_SUFFIX).unwrap();
        assert!(parse_iso8601_compact(stamp).is_some(), "{name}");
    }

    #[test]
    fn test_backup_purges_expired_only() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        fs::create_dir_all(&config.dir).unwrap();

        let now = unix_now();
        let old = config.dir.join(format!(
            "{}{BACKUP_SUFFIX}",
            format_iso8601_compact(now - 30 * 86_400)
        ));
        let recent = config.dir.join(format!(
            "{}{BACKUP_SUFFIX}",
            format_iso8601_compact(now - 86_400)
        ));
        let unrelated = config.dir.join("notes.txt");
        for p in [&old, &recent, &unrelated] {
            fs::write(p, b"x").unwrap();
        }

        let store = TimeSeriesStore::open(tmp.path().join("data")).unwrap();
        let report = store.backup(&config).unwrap();
        assert_eq!(report.purged, vec![old.clone()]);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_store_writable_after_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::open(tmp.path().join("data")).unwrap();
        store.insert("a", 1, 1.0);
        store.backup(&config_in(tmp.path())).unwrap();
        assert_eq!(store.insert("a", 2, 2.0).accepted, 1);
        assert_eq!(store.last_read("a"), Some(Reading::new(2, 2.0)));
    }

    #[test]
    fn test_restore_into_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let report = {
            let store = TimeSeriesStore::open(tmp.path().join("data")).unwrap();
            let raw = RawStateStore::open(tmp.path().join("data")).unwrap();
            store.insert("flow", 100, 4.0);
            raw.swap("meter", 100, 65000.0);
            backup(&store, Some(&raw), &config_in(tmp.path())).unwrap()
        };
        assert_eq!(report.raw_state_keys, 1);

        let target = tmp.path().join("restored");
        let restored = restore(&report.path, &target).unwrap();
        assert_eq!(restored.readings, 1);

        let store = TimeSeriesStore::open(&target).unwrap();
        let raw = RawStateStore::open(&target).unwrap();
        assert_eq!(store.last_read("flow"), Some(Reading::new(100, 4.0)));
        assert_eq!(raw.get("meter"), Some(Reading::new(100, 65000.0)));
    }

    #[test]
    fn test_restore_refuses_dir_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TimeSeriesStore::open(tmp.path().join("data")).unwrap();
        store.insert("flow", 100, 4.0);
        let report = store.backup(&config_in(tmp.path())).unwrap();

        let err = restore(&report.path, &tmp.path().join("data")).unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }

    #[test]
    fn test_backup_values_bit_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let values = [-27.418451678623846, 0.1 + 0.2, 1.0 / 3.0, 5e-324, 9.007_199_254_740_993e15];
        let report = {
            let store = TimeSeriesStore::open(tmp.path().join("data")).unwrap();
            for (i, v) in values.iter().enumerate() {
                store.insert("x", i as i64, *v);
            }
            store.backup(&config_in(tmp.path())).unwrap()
        };
        let target = tmp.path().join("restored");
        restore(&report.path, &target).unwrap();
        let store = TimeSeriesStore::open(&target).unwrap();
        let back: Vec<u64> = store
            .range("x", None, None)
            .iter()
            .map(|r| r.val.to_bits())
            .collect();
        assert_eq!(back, values.iter().map(|v| v.to_bits()).collect::<Vec<_>>());
    }
}
