//! Pending-change bookkeeping between flushes.

use std::collections::BTreeSet;

/// Sessions changed or deleted since the last successful flush.
///
/// An id is never in both sets: marking one side removes it from the other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyTracker {
    changed: BTreeSet<String>,
    deleted: BTreeSet<String>,
    clear_all: bool,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_changed(&mut self, id: &str) {
        self.deleted.remove(id);
        self.changed.insert(id.to_string());
    }

    pub fn mark_deleted(&mut self, id: &str) {
        self.changed.remove(id);
        self.deleted.insert(id.to_string());
    }

    /// Everything goes; earlier per-id marks are subsumed.
    pub fn mark_clear_all(&mut self) {
        self.changed.clear();
        self.deleted.clear();
        self.clear_all = true;
    }

    pub fn changed(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().map(String::as_str)
    }

    pub fn deleted(&self) -> impl Iterator<Item = &str> {
        self.deleted.iter().map(String::as_str)
    }

    pub fn clear_all(&self) -> bool {
        self.clear_all
    }

    /// True when the pending flush removes data.
    pub fn is_destructive(&self) -> bool {
        self.clear_all || !self.deleted.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.clear_all && self.changed.is_empty() && self.deleted.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_are_exclusive() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_changed("s1");
        tracker.mark_deleted("s1");
        assert_eq!(tracker.changed().count(), 0);
        assert_eq!(tracker.deleted().collect::<Vec<_>>(), vec!["s1"]);

        tracker.mark_changed("s1");
        assert_eq!(tracker.deleted().count(), 0);
        assert_eq!(tracker.changed().collect::<Vec<_>>(), vec!["s1"]);
    }

    #[test]
    fn test_clear_all_subsumes_marks() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_changed("s1");
        tracker.mark_deleted("s2");
        tracker.mark_clear_all();
        assert!(tracker.clear_all());
        assert!(tracker.is_destructive());
        assert_eq!(tracker.changed().count() + tracker.deleted().count(), 0);

        tracker.mark_changed("s3");
        assert!(tracker.clear_all());
        assert_eq!(tracker.changed().count(), 1);
    }

    #[test]
    fn test_reset() {
        let mut tracker = DirtyTracker::new();
        assert!(tracker.is_empty());
        tracker.mark_changed("s1");
        assert!(!tracker.is_empty());
        assert!(!tracker.is_destructive());
        tracker.reset();
        assert!(tracker.is_empty());
    }
}
