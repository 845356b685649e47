//! Bounded TTL cache over permission decisions.
//!
//! Keys are `subject:resource:action` strings. The read path takes only a
//! shared lock; expired entries answer as misses and are dropped by the
//! next insert that needs room. When full, the entry with the oldest
//! insertion timestamp is evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Default capacity.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    allowed: bool,
    inserted: Instant,
}

/// The permission decision cache.
#[derive(Debug)]
pub struct PermissionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl PermissionCache {
    /// Creates a cache with the given bounds.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Builds the cache key.
    #[must_use]
    pub fn key(subject: &str, resource: &str, action: &str) -> String {
        format!("{subject}:{resource}:{action}")
    }

    /// Returns the cached decision, if present and unexpired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<bool> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.inserted.elapsed() > self.ttl {
            return None;
        }
        Some(entry.allowed)
    }

    /// Stores a decision, evicting the oldest entry when full.
    pub fn insert(&self, key: impl Into<String>, allowed: bool) {
        let key = key.into();
        let mut entries = self.entries.write();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            // Drop expired entries first; evict the oldest if still full.
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.inserted.elapsed() <= ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                allowed,
                inserted: Instant::now(),
            },
        );
    }

    /// Clears every entry (any policy mutation or global reload).
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Clears entries belonging to one subject (subject-targeted unbind).
    pub fn clear_subject(&self, subject: &str) {
        let prefix = format!("{subject}:");
        self.entries
            .write()
            .retain(|key, _| !key.starts_with(&prefix));
    }

    /// Number of cached entries, expired included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Hit/Miss Tests ====================

    #[test]
    fn test_insert_and_get() {
        let cache = PermissionCache::default();
        cache.insert("u:r:read", true);
        assert_eq!(cache.get("u:r:read"), Some(true));
        assert_eq!(cache.get("u:r:write"), None);
    }

    #[test]
    fn test_key_shape() {
        assert_eq!(PermissionCache::key("u", "r", "read"), "u:r:read");
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = PermissionCache::new(Duration::from_millis(10), 10);
        cache.insert("k", true);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("k"), None);
    }

    // ==================== Eviction Tests ====================

    #[test]
    fn test_oldest_evicted_when_full() {
        let cache = PermissionCache::new(Duration::from_secs(60), 2);
        cache.insert("first", true);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("second", false);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("third", true);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first"), None);
        assert_eq!(cache.get("second"), Some(false));
        assert_eq!(cache.get("third"), Some(true));
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let cache = PermissionCache::new(Duration::from_secs(60), 2);
        cache.insert("a", true);
        cache.insert("b", true);
        cache.insert("a", false);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(false));
        assert_eq!(cache.get("b"), Some(true));
    }

    // ==================== Clearing Tests ====================

    #[test]
    fn test_clear() {
        let cache = PermissionCache::default();
        cache.insert("a:r:x", true);
        cache.insert("b:r:x", true);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_subject_is_scoped() {
        let cache = PermissionCache::default();
        cache.insert("alice:docs:read", true);
        cache.insert("alice:docs:write", false);
        cache.insert("bob:docs:read", true);

        cache.clear_subject("alice");

        assert_eq!(cache.get("alice:docs:read"), None);
        assert_eq!(cache.get("alice:docs:write"), None);
        assert_eq!(cache.get("bob:docs:read"), Some(true));
    }

    #[test]
    fn test_clear_subject_prefix_is_exact() {
        let cache = PermissionCache::default();
        cache.insert("al:docs:read", true);
        cache.clear_subject("a");
        // "al:" does not start with "a:".
        assert_eq!(cache.get("al:docs:read"), Some(true));
    }
}
