//! Throttled JSON mirror of authoritative state.
//!
//! The mirror file is never read on the hot path. It exists for manual
//! inspection and as the recovery source when SQLite cannot be used.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::Error;

/// Default minimum interval between unforced writes.
pub const DEFAULT_MIRROR_INTERVAL: Duration = Duration::from_secs(20);

/// Writes a pretty-printed JSON copy of some state, at most once per interval.
#[derive(Debug)]
pub struct SnapshotMirror {
    path: PathBuf,
    min_interval: Duration,
    last_sync: Mutex<Option<Instant>>,
}

impl SnapshotMirror {
    pub fn new(path: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self { path: path.into(), min_interval, last_sync: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when an unforced [`maybe_sync`](Self::maybe_sync) would write.
    pub fn is_due(&self) -> bool {
        self.last_sync.lock().is_none_or(|at| at.elapsed() >= self.min_interval)
    }

    /// Write `data` unless the last write was less than the interval ago.
    ///
    /// `force` bypasses the throttle; use it for destructive operations and
    /// whenever the primary store failed. Returns whether a write happened.
    pub fn maybe_sync<T: Serialize + ?Sized>(&self, data: &T, force: bool) -> bool {
        let mut last_sync = self.last_sync.lock();
        if !force && last_sync.is_some_and(|at| at.elapsed() < self.min_interval) {
            return false;
        }

        match self.write(data) {
            Ok(()) => {
                *last_sync = Some(Instant::now());
                tracing::info!(path = %self.path.display(), force, "Mirrored snapshot");
                true
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "Snapshot mirror failed");
                false
            }
        }
    }

    /// Atomically replace the mirror file: temp file, fsync, rename, then a
    /// best-effort fsync of the directory so the rename survives a crash.
    pub fn write<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), Error> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let bytes = serde_json::to_vec_pretty(data)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        sync_dir(parent);
        Ok(())
    }

    /// Read the mirror back, `None` when the file does not exist.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(err) = std::fs::File::open(dir).and_then(|file| file.sync_all()) {
            tracing::debug!(dir = %dir.display(), error = %err, "Directory sync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
