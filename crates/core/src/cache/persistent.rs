//! Signature-keyed KV table operations.
//!
//! Provides reads, upserts, and bounded-row pruning for one table of the
//! shape `(cache_key, signature_hash, signature_json, payload_json, updated_at)`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use super::connection::StorageHandle;
use super::schema::Schema;
use super::signature::Signature;
use crate::Error;
use crate::config::CacheConfig;

/// Bounds for one persistent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvOptions {
    /// Rows kept after a prune, newest `updated_at` first.
    pub max_rows: usize,
    /// Prune every N writes even when no novel key was seen.
    pub prune_interval: u64,
    /// Size of the in-memory set of keys already written by this process.
    pub known_keys_capacity: usize,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self { max_rows: 500, prune_interval: 64, known_keys_capacity: 4096 }
    }
}

/// What a [`KvStore::put`] did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// Same signature and payload already stored; no statement was issued.
    Unchanged,
}

/// Persistent tier for one table.
#[derive(Debug)]
pub struct KvStore {
    storage: StorageHandle,
    table: String,
    options: KvOptions,
    known_keys: Mutex<HashSet<String>>,
    writes: AtomicU64,
}

impl KvStore {
    /// Open `table` in the database at `path`.
    pub fn open(path: impl AsRef<Path>, table: &str, options: KvOptions) -> Result<Self, Error> {
        let storage = StorageHandle::new(path, Schema::kv(table)?);
        Self::new(storage, table, options)
    }

    /// `table` in the configured runtime database.
    pub fn from_config(config: &CacheConfig, table: &str) -> Result<Self, Error> {
        let storage = StorageHandle::new(config.runtime_db_path(), Schema::kv(table)?)
            .with_busy_timeout(config.busy_timeout())
            .with_retry(config.retry_policy());
        Self::new(storage, table, config.kv_options())
    }

    /// Wrap an already configured handle. Its schema must own `table`.
    pub fn new(storage: StorageHandle, table: &str, options: KvOptions) -> Result<Self, Error> {
        if !storage.schema().owns(table) {
            return Err(Error::InvalidInput(format!("schema {} does not define {table}", storage.schema().name())));
        }
        Ok(Self {
            storage,
            table: table.to_string(),
            options,
            known_keys: Mutex::new(HashSet::new()),
            writes: AtomicU64::new(0),
        })
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn options(&self) -> KvOptions {
        self.options
    }

    /// Stored payload JSON for `key` under exactly `signature`.
    ///
    /// The hash narrows the lookup; the stored signature JSON is compared as
    /// well so a hash collision can never return a foreign payload.
    pub fn get(&self, key: &str, signature: &Signature) -> Result<Option<String>, Error> {
        let signature_json = signature.to_compact_json();
        let signature_hash = signature.hash();
        let sql = format!(
            "SELECT signature_json, payload_json FROM {} WHERE cache_key = ?1 AND signature_hash = ?2",
            self.table
        );

        self.storage.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(&sql, params![key, signature_hash], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            Ok(row.filter(|(stored, _)| *stored == signature_json).map(|(_, payload)| payload))
        })
    }

    /// Insert or update the payload for `key`.
    ///
    /// Rows holding an older signature for the same key are replaced in the
    /// same transaction. A byte-identical payload under the same signature is
    /// detected up front and nothing is written.
    pub fn put(&self, key: &str, signature: &Signature, payload_json: &str) -> Result<WriteOutcome, Error> {
        let signature_json = signature.to_compact_json();
        let signature_hash = signature.hash();
        let table = &self.table;
        let select = format!(
            "SELECT payload_json FROM {table} WHERE cache_key = ?1 AND signature_hash = ?2 AND signature_json = ?3"
        );
        let delete_stale = format!("DELETE FROM {table} WHERE cache_key = ?1 AND signature_hash <> ?2");
        let upsert = format!(
            "INSERT INTO {table} (cache_key, signature_hash, signature_json, payload_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key, signature_hash) DO UPDATE SET
                signature_json = excluded.signature_json,
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at"
        );

        let outcome = self.storage.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(&select, params![key, signature_hash, signature_json], |row| row.get(0))
                .optional()?;
            if existing.as_deref() == Some(payload_json) {
                return Ok(WriteOutcome::Unchanged);
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(&delete_stale, params![key, signature_hash])?;
            tx.execute(&upsert, params![key, signature_hash, signature_json, payload_json, crate::timestamp()])?;
            tx.commit()?;

            Ok(if existing.is_some() { WriteOutcome::Updated } else { WriteOutcome::Inserted })
        })?;

        match outcome {
            WriteOutcome::Unchanged => tracing::debug!(table = %self.table, key, "Skipped unchanged write"),
            _ => self.after_write(key),
        }
        Ok(outcome)
    }

    /// Delete every row for `key`. Returns the number of rows removed.
    pub fn remove(&self, key: &str) -> Result<usize, Error> {
        let sql = format!("DELETE FROM {} WHERE cache_key = ?1", self.table);
        let deleted = self.storage.with_conn(|conn| Ok(conn.execute(&sql, params![key])?))?;
        self.known_keys.lock().remove(key);
        Ok(deleted)
    }

    /// Delete all rows.
    pub fn clear(&self) -> Result<usize, Error> {
        let sql = format!("DELETE FROM {}", self.table);
        let deleted = self.storage.with_conn(|conn| Ok(conn.execute(&sql, [])?))?;
        self.known_keys.lock().clear();
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize, Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let count: i64 = self.storage.with_conn(|conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))?;
        Ok(count as usize)
    }

    /// Keep only the `max_rows` most recently updated rows.
    ///
    /// Returns the number of deleted rows.
    pub fn prune(&self, max_rows: usize) -> Result<usize, Error> {
        let sql = format!(
            "DELETE FROM {table} WHERE rowid NOT IN (
                SELECT rowid FROM {table} ORDER BY updated_at DESC, rowid DESC LIMIT ?1
            )",
            table = self.table
        );
        let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);
        self.storage.with_conn(|conn| Ok(conn.execute(&sql, params![limit])?))
    }

    /// Prune when the key is new to this process or every `prune_interval`
    /// writes. Failures are logged; the write itself already succeeded.
    fn after_write(&self, key: &str) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        let novel = {
            let mut known = self.known_keys.lock();
            if known.len() >= self.options.known_keys_capacity.max(1) && !known.contains(key) {
                known.clear();
            }
            known.insert(key.to_string())
        };

        if !novel && writes % self.options.prune_interval.max(1) != 0 {
            return;
        }

        match self.prune(self.options.max_rows) {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(table = %self.table, deleted, "Pruned persistent tier"),
            Err(err) => tracing::warn!(table = %self.table, error = %err, "Prune failed"),
        }
    }
}
