//! Exclusive ownership of a data directory.
//!
//! Each store keeps an advisory `flock` on its own lock file for as long as it
//! is open. A second opener, in this process or another, fails instead of
//! building a private copy of the tables that would later overwrite the
//! owner's snapshot.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Held lock on `<dir>/<name>`; released when dropped.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Take the lock without blocking.
    ///
    /// # Errors
    ///
    /// - `Error::StorageUnavailable`: another handle already owns the lock, or
    ///   the lock file cannot be opened
    pub fn acquire(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let unavailable = |reason: String| Error::StorageUnavailable {
            path: dir.display().to_string(),
            reason,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| unavailable(format!("{}: {e}", path.display())))?;

        match try_lock(&file) {
            Ok(true) => {}
            Ok(false) => {
                let owner = std::fs::read_to_string(&path).unwrap_or_default();
                return Err(unavailable(format!(
                    "already open elsewhere (lock {} held by pid {})",
                    path.display(),
                    owner.trim()
                )));
            }
            Err(e) => return Err(unavailable(format!("{}: {e}", path.display()))),
        }

        // Owner pid is informational only.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}
