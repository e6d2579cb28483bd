//! Single-flight schema initialization.
//!
//! One registry entry per normalized database path. While a path is being
//! initialized, every other caller targeting that file blocks on the condition
//! variable, whichever schema it wants, so DDL for one file never runs
//! concurrently. If the leader fails, a woken waiter becomes the next leader.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::{Condvar, Mutex};

use crate::Error;

static GLOBAL: LazyLock<Arc<SchemaRegistry>> = LazyLock::new(|| Arc::new(SchemaRegistry::new()));

#[derive(Debug, Default)]
struct RegistryState {
    /// Schemas known to be applied, per database path.
    ready: HashMap<PathBuf, HashSet<String>>,
    /// Paths with an initialization currently running.
    in_progress: HashSet<PathBuf>,
    /// Successful initializations per path.
    init_runs: HashMap<PathBuf, u64>,
}

impl RegistryState {
    fn is_ready(&self, path: &Path, schema: &str) -> bool {
        self.ready.get(path).is_some_and(|set| set.contains(schema))
    }
}

/// Process-wide readiness registry keyed by normalized database path.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    state: Mutex<RegistryState>,
    wake: Condvar,
}

impl SchemaRegistry {
    /// A fresh, isolated registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every storage handle in the process.
    pub fn global() -> Arc<SchemaRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Forget all readiness state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.ready.clear();
        state.init_runs.clear();
        self.wake.notify_all();
    }

    pub fn is_ready(&self, path: &Path, schema: &str) -> bool {
        self.state.lock().is_ready(path, schema)
    }

    /// Number of successful initializations recorded for `path`.
    pub fn init_runs(&self, path: &Path) -> u64 {
        self.state.lock().init_runs.get(path).copied().unwrap_or(0)
    }

    /// Make sure `init` has completed successfully for `(path, schema)`.
    ///
    /// `force` drops the readiness mark first, so `init` runs again even if it
    /// succeeded before. The fast path only checks the registry and that the
    /// database file still exists.
    pub fn ensure<F>(&self, path: &Path, schema: &str, force: bool, mut init: F) -> Result<(), Error>
    where
        F: FnMut() -> Result<(), Error>,
    {
        let mut state = self.state.lock();
        if force && let Some(set) = state.ready.get_mut(path) {
            set.remove(schema);
        }

        loop {
            if state.is_ready(path, schema) {
                if path.exists() {
                    return Ok(());
                }
                tracing::warn!(path = %path.display(), "Database file disappeared; reinitializing");
                state.ready.remove(path);
            }
            if !state.in_progress.contains(path) {
                break;
            }
            self.wake.wait(&mut state);
        }

        state.in_progress.insert(path.to_path_buf());
        drop(state);

        let result = init();

        let mut state = self.state.lock();
        state.in_progress.remove(path);
        match &result {
            Ok(()) => {
                state.ready.entry(path.to_path_buf()).or_default().insert(schema.to_string());
                *state.init_runs.entry(path.to_path_buf()).or_default() += 1;
                tracing::info!(path = %path.display(), schema, "Schema initialized");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), schema, error = %err, "Schema initialization failed");
            }
        }
        self.wake.notify_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn db_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("runtime_cache.db");
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_ensure_runs_init_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = SchemaRegistry::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            registry
                .ensure(&path, "kv:a", false, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.init_runs(&path), 1);
    }

    #[test]
    fn test_force_reruns_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = SchemaRegistry::new();
        let calls = AtomicUsize::new(0);
        let init = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        registry.ensure(&path, "kv:a", false, init).unwrap();
        registry.ensure(&path, "kv:a", true, init).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deleted_file_clears_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = SchemaRegistry::new();
        let calls = AtomicUsize::new(0);
        let init = || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&path, b"").map_err(Error::from)
        };

        registry.ensure(&path, "kv:a", false, init).unwrap();
        std::fs::remove_file(&path).unwrap();
        registry.ensure(&path, "kv:a", false, init).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_distinct_schemas_on_one_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = SchemaRegistry::new();

        registry.ensure(&path, "kv:a", false, || Ok(())).unwrap();
        assert!(registry.is_ready(&path, "kv:a"));
        assert!(!registry.is_ready(&path, "kv:b"));
        registry.ensure(&path, "kv:b", false, || Ok(())).unwrap();
        assert!(registry.is_ready(&path, "kv:b"));
    }

    #[test]
    fn test_concurrent_callers_single_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = Arc::new(SchemaRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.ensure(&path, "kv:a", false, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn locked() -> Error {
        let code = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        Error::Database(rusqlite::Error::SqliteFailure(code, Some("database is locked".into())))
    }

    #[test]
    fn test_waiter_takes_over_after_leader_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = Arc::new(SchemaRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.ensure(&path, "kv:a", false, || {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        if n == 0 { Err(locked()) } else { Ok(()) }
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.is_ready(&path, "kv:a"));
    }

    #[test]
    fn test_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_file(&dir);
        let registry = SchemaRegistry::new();
        registry.ensure(&path, "kv:a", false, || Ok(())).unwrap();
        registry.reset();
        assert!(!registry.is_ready(&path, "kv:a"));
        assert_eq!(registry.init_runs(&path), 0);
    }
}
