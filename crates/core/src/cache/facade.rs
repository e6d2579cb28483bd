//! Two-tier cache front end.
//!
//! Reads go memory → SQLite; writes go to both. Storage failures never reach
//! the caller: they are logged, counted, and turned into misses, so a broken
//! disk only costs recomputation.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::memory::MemoryTier;
use super::mirror::SnapshotMirror;
use super::persistent::{KvStore, WriteOutcome};
use super::signature::Signature;
use crate::Error;
use crate::config::CacheConfig;

/// Point-in-time counters for one facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_skips: u64,
    pub storage_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_skips: AtomicU64,
    storage_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One logical cache: a memory tier in front of one persistent table.
#[derive(Debug)]
pub struct CacheFacade<T> {
    memory: MemoryTier<T>,
    persistent: KvStore,
    mirror: Option<SnapshotMirror>,
    counters: Counters,
}

impl<T> CacheFacade<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(memory_max_entries: i64, persistent: KvStore) -> Self {
        Self { memory: MemoryTier::new(memory_max_entries), persistent, mirror: None, counters: Counters::default() }
    }

    /// Facade over `table` in the configured runtime database.
    pub fn from_config(config: &CacheConfig, table: &str) -> Result<Self, Error> {
        let persistent = KvStore::from_config(config, table)?;
        Ok(Self::new(config.memory_max_entries, persistent))
    }

    /// Mirror the memory tier's contents to a JSON file after writes.
    pub fn with_mirror(mut self, mirror: SnapshotMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn memory(&self) -> &MemoryTier<T> {
        &self.memory
    }

    pub fn persistent(&self) -> &KvStore {
        &self.persistent
    }

    /// Payload for `key` computed under `signature`, if either tier has it.
    pub fn get(&self, key: &str, signature: &Signature) -> Option<T> {
        if let Some(payload) = self.memory.get(key, signature) {
            bump(&self.counters.memory_hits);
            tracing::debug!(table = %self.persistent.table(), key, "Memory hit");
            return Some(payload);
        }

        let stored = match self.persistent.get(key, signature) {
            Ok(stored) => stored,
            Err(err) => {
                bump(&self.counters.storage_errors);
                tracing::warn!(table = %self.persistent.table(), key, error = %err, "Persistent read failed");
                None
            }
        };

        let payload = stored.and_then(|json| match serde_json::from_str::<T>(&json) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::warn!(table = %self.persistent.table(), key, error = %err, "Discarding undecodable row");
                None
            }
        });

        match payload {
            Some(payload) => {
                bump(&self.counters.persistent_hits);
                tracing::debug!(table = %self.persistent.table(), key, "Persistent hit");
                self.memory.put(key, signature.clone(), &payload);
                Some(payload)
            }
            None => {
                bump(&self.counters.misses);
                tracing::debug!(table = %self.persistent.table(), key, "Miss");
                None
            }
        }
    }

    /// Write through both tiers. Returns whether the persistent tier holds
    /// the payload afterwards.
    pub fn put(&self, key: &str, signature: &Signature, payload: &T) -> bool {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(
                    table = %self.persistent.table(),
                    key,
                    error = %err,
                    "Payload not serializable; skipping write"
                );
                return false;
            }
        };

        self.memory.put(key, signature.clone(), payload);

        let persisted = match self.persistent.put(key, signature, &json) {
            Ok(WriteOutcome::Unchanged) => {
                bump(&self.counters.write_skips);
                true
            }
            Ok(_) => {
                bump(&self.counters.writes);
                true
            }
            Err(err) => {
                bump(&self.counters.storage_errors);
                tracing::warn!(table = %self.persistent.table(), key, error = %err, "Persistent write failed");
                false
            }
        };

        self.sync_mirror(!persisted);
        persisted
    }

    /// Cached payload, or `compute()` written through on a miss.
    pub fn get_or_compute<F>(&self, key: &str, signature: &Signature, compute: F) -> T
    where
        F: FnOnce() -> T,
    {
        if let Some(payload) = self.get(key, signature) {
            return payload;
        }
        let payload = compute();
        self.put(key, signature, &payload);
        payload
    }

    /// Drop `key` from both tiers.
    pub fn invalidate(&self, key: &str) {
        self.memory.remove(key);
        if let Err(err) = self.persistent.remove(key) {
            bump(&self.counters.storage_errors);
            tracing::warn!(table = %self.persistent.table(), key, error = %err, "Persistent delete failed");
        }
        self.sync_mirror(true);
    }

    /// Drop the memory tier only.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Drop both tiers.
    pub fn clear(&self) {
        self.memory.clear();
        if let Err(err) = self.persistent.clear() {
            bump(&self.counters.storage_errors);
            tracing::warn!(table = %self.persistent.table(), error = %err, "Persistent clear failed");
        }
        self.sync_mirror(true);
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            write_skips: c.write_skips.load(Ordering::Relaxed),
            storage_errors: c.storage_errors.load(Ordering::Relaxed),
        }
    }

    fn sync_mirror(&self, force: bool) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        if !force && !mirror.is_due() {
            return;
        }
        let snapshot: serde_json::Map<String, serde_json::Value> = self
            .memory
            .entries()
            .into_iter()
            .filter_map(|(key, payload)| serde_json::to_value(payload).ok().map(|value| (key, value)))
            .collect();
        mirror.maybe_sync(&snapshot, force);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::connection::StorageHandle;
    use crate::cache::persistent::KvOptions;
    use crate::cache::schema::Schema;
    use crate::cache::registry::SchemaRegistry;
    use crate::cache::retry::RetryPolicy;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        ticker: String,
        price: i64,
    }

    fn facade_of<T>(path: std::path::PathBuf, memory: i64) -> CacheFacade<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let storage = StorageHandle::new(path, Schema::kv("realtime_prices").unwrap())
            .with_registry(Arc::new(SchemaRegistry::new()))
            .with_retry(RetryPolicy::none());
        CacheFacade::new(memory, KvStore::new(storage, "realtime_prices", KvOptions::default()).unwrap())
    }

    fn facade_at(path: std::path::PathBuf, memory: i64) -> CacheFacade<Quote> {
        facade_of(path, memory)
    }

    fn quote(ticker: &str, price: i64) -> Quote {
        Quote { ticker: ticker.to_string(), price }
    }

    #[test]
    fn test_memory_then_persistent_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8);
        let sig = Signature::from((100, 200));

        assert!(cache.put("005930", &sig, &quote("005930", 71_000)));
        assert_eq!(cache.get("005930", &sig), Some(quote("005930", 71_000)));

        cache.clear_memory();
        assert_eq!(cache.get("005930", &sig), Some(quote("005930", 71_000)));
        assert_eq!(cache.get("005930", &sig), Some(quote("005930", 71_000)));

        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 2);
        assert_eq!(stats.persistent_hits, 1);
    }

    #[test]
    fn test_stale_signature_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8);
        cache.put("005930", &Signature::from((100, 200)), &quote("005930", 1));

        assert_eq!(cache.get("005930", &Signature::from((101, 200))), None);
        cache.clear_memory();
        assert_eq!(cache.get("005930", &Signature::from((101, 200))), None);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_repeated_put_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8);
        let sig = Signature::version(1);
        cache.put("k", &sig, &quote("k", 1));
        cache.put("k", &sig, &quote("k", 1));
        let stats = cache.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.write_skips, 1);
    }

    #[test]
    fn test_get_or_compute_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8);
        let sig = Signature::version(3);
        let mut runs = 0;

        for _ in 0..3 {
            let value = cache.get_or_compute("000660", &sig, || {
                runs += 1;
                quote("000660", 120_000)
            });
            assert_eq!(value.price, 120_000);
        }
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_unserializable_payload_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache: CacheFacade<BTreeMap<(i64, i64), i64>> = facade_of(dir.path().join("runtime_cache.db"), 8);
        let sig = Signature::version(1);
        let payload = BTreeMap::from([((1, 2), 3)]);

        assert!(!cache.put("k", &sig, &payload));
        assert!(cache.memory().is_empty());
        assert_eq!(cache.persistent().count().unwrap(), 0);
        assert_eq!(cache.stats().writes, 0);
    }

    #[test]
    fn test_undecodable_row_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8);
        let sig = Signature::from((100, 200));
        cache.persistent().put("005930", &sig, "not json").unwrap();

        assert_eq!(cache.get("005930", &sig), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.storage_errors, 0);
    }

    #[test]
    fn test_unavailable_storage_degrades_to_miss() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let cache = facade_at(blocker.join("runtime_cache.db"), 8);
        let sig = Signature::version(1);

        assert!(!cache.put("k", &sig, &quote("k", 1)));
        cache.clear_memory();
        assert_eq!(cache.get("k", &sig), None);
        let value = cache.get_or_compute("k", &sig, || quote("k", 2));
        assert_eq!(value.price, 2);
        assert!(cache.stats().storage_errors >= 2);
    }

    #[test]
    fn test_invalidate_removes_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8);
        let sig = Signature::version(1);
        cache.put("k", &sig, &quote("k", 1));
        cache.invalidate("k");
        assert_eq!(cache.get("k", &sig), None);
        assert_eq!(cache.persistent().count().unwrap(), 0);
    }

    #[test]
    fn test_put_mirrors_memory_tier() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = SnapshotMirror::new(dir.path().join("prices.json"), Duration::from_secs(3600));
        let cache = facade_at(dir.path().join("runtime_cache.db"), 8).with_mirror(mirror);

        cache.put("005930", &Signature::version(1), &quote("005930", 5));
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("prices.json")).unwrap()).unwrap();
        assert_eq!(written, json!({"005930": {"ticker": "005930", "price": 5}}));
    }

    #[test]
    fn test_from_config_uses_runtime_db() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };
        let cache: CacheFacade<Quote> = CacheFacade::from_config(&config, "market_rows").unwrap();
        assert!(cache.put("k", &Signature::version(1), &quote("k", 1)));
        assert!(dir.path().join("runtime_cache.db").exists());
    }
}
