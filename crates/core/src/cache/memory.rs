//! Bounded in-process memory tier.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::signature::Signature;

/// Strict LRU map from cache key to `(signature, payload)`.
///
/// Payloads are cloned on the way in and on the way out, so callers never
/// share a mutable value with the cache.
#[derive(Debug)]
pub struct MemoryTier<T> {
    entries: Mutex<LruCache<String, (Signature, T)>>,
}

impl<T: Clone> MemoryTier<T> {
    /// `max_entries <= 0` keeps only the most recent entry.
    pub fn new(max_entries: i64) -> Self {
        let capacity = usize::try_from(max_entries).ok().and_then(NonZeroUsize::new).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)) }
    }

    /// Payload for `key` if it was stored under an equal signature.
    ///
    /// A signature mismatch is a miss and leaves the entry's recency alone.
    pub fn get(&self, key: &str, signature: &Signature) -> Option<T> {
        let mut entries = self.entries.lock();
        match entries.peek(key) {
            Some((stored, _)) if stored == signature => {}
            _ => return None,
        }
        entries.get(key).map(|(_, payload)| payload.clone())
    }

    /// Store a payload, returning the key evicted to make room, if any.
    pub fn put(&self, key: &str, signature: Signature, payload: &T) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.push(key.to_string(), (signature, payload.clone())) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Current contents, most recently used first.
    pub fn entries(&self) -> Vec<(String, T)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, (_, payload))| (key.clone(), payload.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(n: u64) -> Signature {
        Signature::version(n)
    }

    #[test]
    fn test_get_requires_matching_signature() {
        let tier = MemoryTier::new(4);
        tier.put("005930", sig(1), &"samsung".to_string());
        assert_eq!(tier.get("005930", &sig(1)).as_deref(), Some("samsung"));
        assert_eq!(tier.get("005930", &sig(2)), None);
        assert_eq!(tier.get("000660", &sig(1)), None);
    }

    #[test]
    fn test_touched_entry_survives_eviction() {
        let tier = MemoryTier::new(2);
        tier.put("a", sig(1), &1);
        tier.put("b", sig(1), &2);
        assert_eq!(tier.get("a", &sig(1)), Some(1));

        let evicted = tier.put("c", sig(1), &3);
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("a", &sig(1)), Some(1));
        assert_eq!(tier.get("b", &sig(1)), None);
    }

    #[test]
    fn test_stale_hit_does_not_refresh_recency() {
        let tier = MemoryTier::new(2);
        tier.put("a", sig(1), &1);
        tier.put("b", sig(1), &2);
        assert_eq!(tier.get("a", &sig(9)), None);

        let evicted = tier.put("c", sig(1), &3);
        assert_eq!(evicted.as_deref(), Some("a"));
    }

    #[test]
    fn test_non_positive_capacity_keeps_one() {
        for max in [0, -5] {
            let tier = MemoryTier::new(max);
            tier.put("a", sig(1), &1);
            tier.put("b", sig(1), &2);
            assert_eq!(tier.capacity(), 1);
            assert_eq!(tier.len(), 1);
            assert_eq!(tier.get("b", &sig(1)), Some(2));
        }
    }

    #[test]
    fn test_overwrite_same_key_is_not_eviction() {
        let tier = MemoryTier::new(2);
        tier.put("a", sig(1), &1);
        assert_eq!(tier.put("a", sig(2), &2), None);
        assert_eq!(tier.get("a", &sig(2)), Some(2));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_returned_payload_is_a_copy() {
        let tier = MemoryTier::new(2);
        tier.put("a", sig(1), &vec![1, 2]);
        let mut copy = tier.get("a", &sig(1)).unwrap();
        copy.push(3);
        assert_eq!(tier.get("a", &sig(1)), Some(vec![1, 2]));
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = MemoryTier::new(3);
        tier.put("a", sig(1), &1);
        tier.put("b", sig(1), &2);
        assert!(tier.remove("a"));
        assert!(!tier.remove("a"));
        tier.clear();
        assert!(tier.is_empty());
    }
}
