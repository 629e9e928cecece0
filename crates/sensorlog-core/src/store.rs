//! Durable per-key time-series store.
//!
//! All series live in one logical table keyed by `(series_key, ts)`: an
//! in-memory `BTreeMap<ts, value>` per key, persisted as a compacted snapshot
//! plus an append-only journal of upserts.
//!
//! # Storage Format
//!
//! The data directory contains:
//! - `readings.snapshot.json`: every series at the last compaction
//! - `readings.journal`: one JSON object per upsert since that compaction
//!
//! [`TimeSeriesStore::open`] loads the snapshot, replays the journal, and
//! compacts. A torn final journal line (crash mid-write) is skipped with a
//! warning; an unreadable snapshot is fatal.
//!
//! # Concurrency
//!
//! One process owns a data directory at a time: `open` takes an exclusive
//! lock on `readings.lock` and a second opener fails. Within the process,
//! readers share an `RwLock`; writers take it exclusively, append to the
//! journal, and commit (flush + fsync) once per batch before returning.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::unix_now;
use crate::error::{Error, Result};
use crate::lock::DirLock;
use crate::reading::{InsertOutcome, KeyedReading, Reading, normalize_key, validate_key};

const SNAPSHOT_FILE: &str = "readings.snapshot.json";
const JOURNAL_FILE: &str = "readings.journal";
const LOCK_FILE: &str = "readings.lock";
const SNAPSHOT_VERSION: u32 = 1;

/// Journal length (entries) past which a commit triggers compaction.
const DEFAULT_COMPACT_THRESHOLD: usize = 500_000;

// ---------------------------------------------------------------------------
// On-disk records
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    key: String,
    ts: i64,
    val: f64,
}

/// One series as written to a snapshot or backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub key: String,
    pub points: Vec<(i64, f64)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    created_at: i64,
    series: Vec<SeriesSnapshot>,
}

// ---------------------------------------------------------------------------
// In-memory tables
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Series {
    /// Spelling of the key on its first accepted write.
    name: String,
    points: BTreeMap<i64, f64>,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    series: HashMap<String, Series>,
}

impl Tables {
    fn upsert(&mut self, key: &str, ts: i64, val: f64) -> Option<f64> {
        self.series
            .entry(normalize_key(key))
            .or_insert_with(|| Series {
                name: key.trim().to_string(),
                points: BTreeMap::new(),
            })
            .points
            .insert(ts, val)
    }

    fn undo(&mut self, norm: &str, ts: i64, previous: Option<f64>) {
        let Some(series) = self.series.get_mut(norm) else {
            return;
        };
        match previous {
            Some(v) => {
                series.points.insert(ts, v);
            }
            None => {
                series.points.remove(&ts);
                if series.points.is_empty() {
                    self.series.remove(norm);
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SeriesSnapshot> {
        let mut out: Vec<SeriesSnapshot> = self
            .series
            .values()
            .map(|s| SeriesSnapshot {
                key: s.name.clone(),
                points: s.points.iter().map(|(&t, &v)| (t, v)).collect(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

struct Journal {
    writer: BufWriter<File>,
    entries: usize,
}

impl Journal {
    fn open(path: &Path, entries: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            entries,
        })
    }

    fn append(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.entries += 1;
        Ok(())
    }

    fn commit(&mut self, sync: bool) -> std::io::Result<()> {
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Options for [`TimeSeriesStore::open_with_options`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// fsync the journal on every commit. Disable only for throwaway stores.
    pub sync_on_commit: bool,
    /// Compact once the journal holds this many entries.
    pub compact_threshold: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

/// Thread-safe, durable per-key time-series store.
pub struct TimeSeriesStore {
    dir: PathBuf,
    tables: RwLock<Tables>,
    journal: Mutex<Journal>,
    options: StoreOptions,
    _lock: DirLock,
}

impl TimeSeriesStore {
    /// Open (or create) the store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// - `Error::StorageUnavailable`: the directory cannot be created, another
    ///   store already has it open, or the snapshot/journal cannot be read back
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(dir, StoreOptions::default())
    }

    pub fn open_with_options(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let unavailable = |reason: String| Error::StorageUnavailable {
            path: dir.display().to_string(),
            reason,
        };

        fs::create_dir_all(&dir).map_err(|e| unavailable(e.to_string()))?;
        let lock = DirLock::acquire(&dir, LOCK_FILE)?;

        let mut tables = Tables::default();
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let file = File::open(&snapshot_path).map_err(|e| unavailable(e.to_string()))?;
            let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| unavailable(format!("corrupt snapshot: {e}")))?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(unavailable(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            load_series(&mut tables, snapshot.series);
        }

        let journal_path = dir.join(JOURNAL_FILE);
        let replayed = replay_journal(&journal_path, &mut tables)
            .map_err(|e| unavailable(format!("journal replay failed: {e}")))?;

        let journal = Journal::open(&journal_path, replayed).map_err(|e| unavailable(e.to_string()))?;
        let store = Self {
            dir,
            tables: RwLock::new(tables),
            journal: Mutex::new(journal),
            options,
            _lock: lock,
        };
        if replayed > 0 {
            store.compact()?;
        }
        info!(
            "opened reading store at {} ({} series, {} replayed journal entries)",
            store.dir.display(),
            store.keys().len(),
            replayed
        );
        Ok(store)
    }

    /// Data directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Insert or overwrite the reading at `(key, ts)`.
    ///
    /// Non-finite values and reserved/empty keys are rejected without touching
    /// storage.
    pub fn insert(&self, key: &str, ts: i64, val: f64) -> InsertOutcome {
        self.insert_batch(&[KeyedReading::new(key, ts, val)])
    }

    /// Insert a batch with per-record isolation and a single commit.
    ///
    /// A record that fails to persist is counted as rejected; the rest of the
    /// batch continues. Nothing here returns an error.
    pub fn insert_batch(&self, readings: &[KeyedReading]) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        if readings.is_empty() {
            return outcome;
        }

        let mut tables = self.write_tables();
        let mut journal = self.lock_journal();
        let mut undo: Vec<(String, i64, Option<f64>)> = Vec::with_capacity(readings.len());

        for r in readings {
            if !r.val.is_finite() {
                debug!("rejected non-finite value for '{}' at {}", r.key, r.ts);
                outcome.rejected += 1;
                continue;
            }
            if let Err(e) = validate_key(&r.key) {
                warn!("rejected reading: {e}");
                outcome.rejected += 1;
                continue;
            }
            let entry = JournalEntry {
                key: r.key.trim().to_string(),
                ts: r.ts,
                val: r.val,
            };
            if let Err(e) = journal.append(&entry) {
                error!("failed to journal reading for '{}' at {}: {e}", r.key, r.ts);
                outcome.rejected += 1;
                continue;
            }
            let previous = tables.upsert(&r.key, r.ts, r.val);
            undo.push((normalize_key(&r.key), r.ts, previous));
            outcome.accepted += 1;
        }

        if outcome.accepted > 0 {
            if let Err(e) = journal.commit(self.options.sync_on_commit) {
                error!(
                    "commit failed, discarding {} readings from this batch: {e}",
                    outcome.accepted
                );
                for (norm, ts, previous) in undo.into_iter().rev() {
                    tables.undo(&norm, ts, previous);
                }
                outcome.rejected += outcome.accepted;
                outcome.accepted = 0;
            }
        }

        let needs_compaction = journal.entries >= self.options.compact_threshold;
        drop(journal);
        drop(tables);

        if needs_compaction {
            if let Err(e) = self.compact() {
                warn!("journal compaction failed: {e}");
            }
        }
        outcome
    }

    /// Most recent `n` readings for `key`, newest first.
    pub fn last(&self, key: &str, n: usize) -> Vec<Reading> {
        let tables = self.read_tables();
        tables
            .series
            .get(&normalize_key(key))
            .map(|s| {
                s.points
                    .iter()
                    .rev()
                    .take(n)
                    .map(|(&ts, &val)| Reading::new(ts, val))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The newest reading for `key`, if any.
    pub fn last_read(&self, key: &str) -> Option<Reading> {
        self.last(key, 1).into_iter().next()
    }

    /// Readings in `[start, end]` in ascending order. Either bound may be open.
    pub fn range(&self, key: &str, start: Option<i64>, end: Option<i64>) -> Vec<Reading> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Vec::new();
            }
        }
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Included);

        let tables = self.read_tables();
        tables
            .series
            .get(&normalize_key(key))
            .map(|s| {
                s.points
                    .range((lower, upper))
                    .map(|(&ts, &val)| Reading::new(ts, val))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Case-insensitive check for a series with at least one reading.
    pub fn key_exists(&self, key: &str) -> bool {
        self.read_tables()
            .series
            .contains_key(&normalize_key(key))
    }

    /// All series keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .read_tables()
            .series
            .values()
            .map(|s| s.name.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of readings across all series with `ts > since`.
    pub fn reading_count(&self, since: i64) -> usize {
        self.read_tables()
            .series
            .values()
            .map(|s| {
                s.points
                    .range((Bound::Excluded(since), Bound::Unbounded))
                    .count()
            })
            .sum()
    }

    /// Force a commit point for anything buffered in the journal.
    pub fn flush(&self) -> Result<()> {
        self.lock_journal().commit(self.options.sync_on_commit)?;
        Ok(())
    }

    /// Rewrite the snapshot from memory and truncate the journal.
    pub fn compact(&self) -> Result<()> {
        let tables = self.write_tables();
        let mut journal = self.lock_journal();
        journal.commit(self.options.sync_on_commit)?;

        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            created_at: unix_now(),
            series: tables.snapshot(),
        };
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut w, &snapshot)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;

        let journal_path = self.dir.join(JOURNAL_FILE);
        File::create(&journal_path)?;
        *journal = Journal::open(&journal_path, 0)?;
        debug!("compacted reading store at {}", self.dir.display());
        Ok(())
    }

    /// Run `f` while holding the write-intent window: no writer can commit
    /// while it runs, and the journal is flushed before it starts.
    pub(crate) fn with_write_intent<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let tables = self.write_tables();
        self.lock_journal().commit(self.options.sync_on_commit)?;
        Ok(f(&*tables))
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TimeSeriesStore {
    fn drop(&mut self) {
        if let Err(e) = self.lock_journal().commit(self.options.sync_on_commit) {
            error!("failed to flush reading journal on shutdown: {e}");
        }
    }
}

fn load_series(tables: &mut Tables, series: Vec<SeriesSnapshot>) {
    for s in series {
        for (ts, val) in s.points {
            if val.is_finite() {
                tables.upsert(&s.key, ts, val);
            }
        }
    }
}

/// Replay journal entries into `tables`, returning how many were applied.
fn replay_journal(path: &Path, tables: &mut Tables) -> std::io::Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut applied = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) if entry.val.is_finite() => {
                tables.upsert(&entry.key, entry.ts, entry.val);
                applied += 1;
            }
            Ok(_) => {}
            Err(e) => warn!(
                "skipping unreadable journal line {} in {}: {e}",
                lineno + 1,
                path.display()
            ),
        }
    }
    Ok(applied)
}

/// Replace the on-disk snapshot in `dir` (used when restoring a backup).
/// Fails if a store has `dir` open.
pub(crate) fn write_snapshot_file(dir: &Path, series: Vec<SeriesSnapshot>) -> Result<()> {
    fs::create_dir_all(dir)?;
    let _lock = DirLock::acquire(dir, LOCK_FILE)?;
    let snapshot = SnapshotFile {
        version: SNAPSHOT_VERSION,
        created_at: unix_now(),
        series,
    };
    let mut w = BufWriter::new(File::create(dir.join(SNAPSHOT_FILE))?);
    serde_json::to_writer(&mut w, &snapshot)?;
    w.flush()?;
    // A restored snapshot supersedes any journal left in the directory.
    File::create(dir.join(JOURNAL_FILE))?;
    Ok(())
}
