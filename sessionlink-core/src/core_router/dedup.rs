//! Inbound redelivery filter
//!
//! Fingerprints live in an LRU bounded by count, and entries older than the
//! horizon are pruned on every check. Lookups use `peek` so a redelivery does
//! not refresh its own entry.

use hashlink::LruCache;
use std::time::Duration;
use tokio::time::Instant;

pub struct DedupCache {
    entries: LruCache<String, Instant>,
    horizon: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, horizon: Duration) -> Self {
        Self {
            entries: LruCache::new(capacity.max(1)),
            horizon,
        }
    }

    /// Record `fingerprint`; returns false if it was already present
    pub fn check_and_insert(&mut self, fingerprint: &str, now: Instant) -> bool {
        self.prune(now);
        if self.entries.peek(fingerprint).is_some() {
            return false;
        }
        self.entries.insert(fingerprint.to_string(), now);
        true
    }

    /// Forget `fingerprint`; returns whether it was present
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        self.entries.remove(fingerprint).is_some()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.peek(fingerprint).is_some()
    }

    /// Drop entries first seen at least `horizon` before `now`
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        loop {
            let Some(first_seen) = self.entries.iter().next().map(|(_, at)| *at) else {
                break;
            };
            if now.saturating_duration_since(first_seen) < self.horizon {
                break;
            }
            self.entries.remove_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detected() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.check_and_insert("chat:new_message:alice:abc", now));
        assert!(!cache.check_and_insert("chat:new_message:alice:abc", now));
        assert!(cache.check_and_insert("chat:new_message:alice:abd", now));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_removed_entry_is_fresh_again() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.check_and_insert("key_exchange:ker_1:request", now));
        assert!(cache.remove("key_exchange:ker_1:request"));
        assert!(!cache.remove("key_exchange:ker_1:request"));
        assert!(cache.check_and_insert("key_exchange:ker_1:request", now));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = DedupCache::new(3, Duration::from_secs(60));
        let now = Instant::now();
        for fp in ["a", "b", "c", "d"] {
            assert!(cache.check_and_insert(fp, now));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("a"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_redelivery_does_not_refresh_entry() {
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        let now = Instant::now();
        cache.check_and_insert("a", now);
        cache.check_and_insert("b", now);
        assert!(!cache.check_and_insert("a", now));
        cache.check_and_insert("c", now);

        // "a" was still the oldest entry
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_horizon_prunes_old_entries() {
        let mut cache = DedupCache::new(100, Duration::from_secs(300));
        cache.check_and_insert("old", Instant::now());

        tokio::time::advance(Duration::from_secs(200)).await;
        cache.check_and_insert("newer", Instant::now());
        assert!(!cache.check_and_insert("old", Instant::now()));

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(cache.prune(Instant::now()), 1);
        assert!(cache.check_and_insert("old", Instant::now()));
        assert!(cache.contains("newer"));
    }
}
