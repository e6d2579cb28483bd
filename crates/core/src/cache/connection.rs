//! Database connection management with pragma configuration.
//!
//! A [`StorageHandle`] owns one SQLite file and one [`Schema`]. Connections are
//! opened per operation with WAL, `synchronous=NORMAL` and a busy timeout;
//! schema creation goes through the process-wide [`SchemaRegistry`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use super::registry::SchemaRegistry;
use super::retry::RetryPolicy;
use super::schema::Schema;
use crate::Error;

/// Default busy timeout applied to every connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to one SQLite database file and the schema it must carry.
#[derive(Clone, Debug)]
pub struct StorageHandle {
    path: PathBuf,
    schema: Arc<Schema>,
    busy_timeout: Duration,
    retry: RetryPolicy,
    registry: Arc<SchemaRegistry>,
}

impl StorageHandle {
    /// Create a handle for `path`. Nothing is opened until the first operation.
    pub fn new(path: impl AsRef<Path>, schema: Schema) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            schema: Arc::new(schema),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retry: RetryPolicy::default(),
            registry: SchemaRegistry::global(),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use an isolated registry instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Normalized absolute path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Open a connection with the standard pragmas applied.
    pub fn connect(&self) -> Result<Connection, Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    /// Ensure the schema exists, logging instead of failing.
    pub fn ensure(&self, force: bool) -> bool {
        match self.try_ensure(force) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "Storage unavailable");
                false
            }
        }
    }

    /// Ensure the schema exists. Concurrent callers for the same file share
    /// one initialization.
    pub fn try_ensure(&self, force: bool) -> Result<(), Error> {
        self.registry.ensure(&self.path, self.schema.name(), force, || {
            self.retry.run(|| {
                let conn = self.connect()?;
                self.schema.apply(&conn)
            })
        })
    }

    /// True when `err` is a "no such table" for a table this schema owns.
    pub fn is_missing_schema(&self, err: &Error) -> bool {
        err.missing_table().is_some_and(|table| self.schema.owns(table))
    }

    /// Run `op` on a fresh connection.
    ///
    /// Lock contention is retried by the handle's [`RetryPolicy`]. A missing
    /// table triggers one forced re-initialization followed by a single rerun
    /// of the whole operation.
    pub fn with_conn<T, F>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        self.try_ensure(false)?;

        let mut recovered = false;
        loop {
            let result = self.retry.run(|| {
                let mut conn = self.connect()?;
                op(&mut conn)
            });
            match result {
                Err(err) if self.is_missing_schema(&err) => {
                    if recovered {
                        let table = err.missing_table().unwrap_or_default().to_string();
                        return Err(Error::SchemaMissing(table));
                    }
                    tracing::warn!(path = %self.path.display(), error = %err, "Schema missing; reinitializing");
                    self.try_ensure(true)?;
                    recovered = true;
                }
                other => return other,
            }
        }
    }
}

/// Resolve `path` to an absolute path with symlinks in its parent resolved,
/// so the same file always maps to the same registry entry.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let resolved = match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => absolute.clone(),
        },
        _ => absolute.clone(),
    };
    if cfg!(windows) { PathBuf::from(resolved.to_string_lossy().to_lowercase()) } else { resolved }
}
