//! Last raw `(ts, value)` per series key, for stateful transforms.
//!
//! [`RawStateStore::swap`] is the only mutator: it stores the new pair and
//! hands back the previous one under a single mutex, so concurrent callers for
//! the same key each see the true prior state exactly once. Every swap is
//! appended to `raw_state.journal` and the journal is replayed on open. An
//! open store holds `raw_state.lock`, so only one owner per directory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::DirLock;
use crate::reading::{Reading, normalize_key};

const JOURNAL_FILE: &str = "raw_state.journal";
const LOCK_FILE: &str = "raw_state.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RawStateEntry {
    pub key: String,
    pub ts: i64,
    pub val: f64,
}

struct Inner {
    state: HashMap<String, RawStateEntry>,
    journal: Option<BufWriter<File>>,
}

/// Keyed last-raw-reading table.
pub struct RawStateStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
    _lock: Option<DirLock>,
}

impl RawStateStore {
    /// Open (or create) the raw state journal inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let unavailable = |reason: String| Error::StorageUnavailable {
            path: dir.display().to_string(),
            reason,
        };
        fs::create_dir_all(dir).map_err(|e| unavailable(e.to_string()))?;
        let lock = DirLock::acquire(dir, LOCK_FILE)?;

        let path = dir.join(JOURNAL_FILE);
        let mut state = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path).map_err(|e| unavailable(e.to_string()))?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line.map_err(|e| unavailable(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawStateEntry>(&line) {
                    Ok(entry) => {
                        state.insert(normalize_key(&entry.key), entry);
                    }
                    Err(e) => warn!("skipping unreadable raw state line {}: {e}", lineno + 1),
                }
            }
        }

        // Rewrite the journal with one line per key so it cannot grow without bound.
        let store = Self {
            path: Some(path),
            inner: Mutex::new(Inner {
                state,
                journal: None,
            }),
            _lock: Some(lock),
        };
        store.compact().map_err(|e| unavailable(e.to_string()))?;
        Ok(store)
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner {
                state: HashMap::new(),
                journal: None,
            }),
            _lock: None,
        }
    }

    /// Last raw reading recorded for `key`.
    pub fn get(&self, key: &str) -> Option<Reading> {
        self.lock()
            .state
            .get(&normalize_key(key))
            .map(|e| Reading::new(e.ts, e.val))
    }

    /// Store `(ts, val)` for `key` and return what was there before.
    ///
    /// The in-memory swap always happens; a journal write failure is logged and
    /// only affects what survives a restart.
    pub fn swap(&self, key: &str, ts: i64, val: f64) -> Option<Reading> {
        let mut inner = self.lock();
        let entry = RawStateEntry {
            key: key.trim().to_string(),
            ts,
            val,
        };
        if let Some(journal) = inner.journal.as_mut() {
            if let Err(e) = append(journal, &entry) {
                error!("failed to persist raw state for '{key}': {e}");
            }
        }
        let prior = inner
            .state
            .insert(normalize_key(key), entry)
            .map(|e| Reading::new(e.ts, e.val));
        debug!("raw state swap '{key}': {prior:?} -> ({ts}, {val})");
        prior
    }

    /// Every key with its raw state, sorted by key.
    pub(crate) fn entries(&self) -> Vec<RawStateEntry> {
        let mut out: Vec<RawStateEntry> = self.lock().state.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn compact(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut inner = self.lock();
        let tmp = path.with_extension("journal.tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for entry in inner.state.values() {
                let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
            }
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        let file = OpenOptions::new().append(true).open(path)?;
        inner.journal = Some(BufWriter::new(file));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replace the raw state journal in `dir` with `entries` (used by restore).
pub(crate) fn write_journal(dir: &Path, entries: &[RawStateEntry]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let _lock = DirLock::acquire(dir, LOCK_FILE)?;
    let mut w = BufWriter::new(File::create(dir.join(JOURNAL_FILE))?);
    for entry in entries {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

fn append(journal: &mut BufWriter<File>, entry: &RawStateEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    journal.write_all(line.as_bytes())?;
    journal.write_all(b"\n")?;
    journal.flush()
}
