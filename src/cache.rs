//! Session-scoped content cache
//!
//! Results derived purely from file content (extracted symbols, heuristic
//! reflection findings) are memoized by a checksum of that content. A cache is
//! created by whoever owns the session and handed to the components that use
//! it; nothing here is global, and entries are never evicted while the cache
//! lives.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Checksum of a single piece of content
pub fn content_checksum(content: &str) -> u64 {
    checksum_parts(&[content])
}

/// Checksum over several pieces; part boundaries are significant.
pub fn checksum_parts(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.len().hash(&mut hasher);
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
pub struct ContentCache<V> {
    entries: Mutex<HashMap<u64, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Default for ContentCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl<V> ContentCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, building it on a miss.
    ///
    /// `build` runs outside the lock, so two callers racing on the same key
    /// may both build; the first insert wins.
    pub fn get_or_insert_with(&self, key: u64, build: impl FnOnce() -> V) -> Arc<V> {
        if let Some(found) = self.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(found);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(build());
        Arc::clone(self.lock().entry(key).or_insert(value))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<V>>> {
        // Entries are immutable once inserted, so a poisoned map is still usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_and_misses() {
        let cache: ContentCache<usize> = ContentCache::new();
        let key = content_checksum("abc");
        let mut builds = 0;
        let first = cache.get_or_insert_with(key, || {
            builds += 1;
            3
        });
        let second = cache.get_or_insert_with(key, || {
            builds += 1;
            99
        });
        assert_eq!((*first, *second), (3, 3));
        assert_eq!(builds, 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_part_boundaries_matter() {
        assert_ne!(checksum_parts(&["ab", "c"]), checksum_parts(&["a", "bc"]));
        assert_eq!(content_checksum("x"), content_checksum("x"));
    }
}
