//! Worker-side caches: interned names, memoized query results, and
//! deduplicated items.
//!
//! The name and result caches are volatile — a reset discards them by
//! swapping in fresh instances behind an `RwLock`, which publishes the
//! swap atomically to later snapshots while requests already holding a
//! snapshot keep reading the old generation. The item cache deduplicates
//! by content hash and survives resets.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::syschar::Item;

// ---------------------------------------------------------------------------
// Name interning
// ---------------------------------------------------------------------------

/// Interns field/entity names so repeated items share one allocation.
#[derive(Debug, Default)]
pub struct NameCache {
    names: DashMap<String, Arc<str>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical shared copy of `name`.
    pub fn intern(&self, name: &str) -> Arc<str> {
        if let Some(existing) = self.names.get(name) {
            return Arc::clone(existing.value());
        }
        self.names
            .entry(name.to_string())
            .or_insert_with(|| Arc::from(name))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Result memoization
// ---------------------------------------------------------------------------

/// Memoizes collected item sets per (object id, query flags) pair.
#[derive(Debug, Default)]
pub struct ResultCache {
    results: DashMap<(String, u32), Vec<Arc<Item>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object_id: &str, flags: u32) -> Option<Vec<Arc<Item>>> {
        self.results
            .get(&(object_id.to_string(), flags))
            .map(|r| r.value().clone())
    }

    pub fn put(&self, object_id: &str, flags: u32, items: Vec<Arc<Item>>) {
        self.results.insert((object_id.to_string(), flags), items);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Item deduplication
// ---------------------------------------------------------------------------

/// Deduplicates items by content hash; identical items collected for
/// different objects share one allocation.
#[derive(Debug, Default)]
pub struct ItemCache {
    items: DashMap<u64, Arc<Item>>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical shared copy of `item`.
    pub fn dedup(&self, item: Item) -> Arc<Item> {
        let hash = item.content_hash();
        if let Some(existing) = self.items.get(&hash) {
            // Hash collisions fall back to the candidate's own allocation.
            if **existing.value() == item {
                return Arc::clone(existing.value());
            }
            return Arc::new(item);
        }
        self.items
            .entry(hash)
            .or_insert_with(|| Arc::new(item))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Cache set
// ---------------------------------------------------------------------------

/// The volatile generation: swapped wholesale on reset.
#[derive(Debug)]
struct VolatileCaches {
    names: Arc<NameCache>,
    results: Arc<ResultCache>,
}

/// A consistent view of the caches taken at the start of one request.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub names: Arc<NameCache>,
    pub results: Arc<ResultCache>,
    pub items: Arc<ItemCache>,
}

/// All worker caches plus the reset mechanism.
#[derive(Debug)]
pub struct CacheSet {
    volatile: RwLock<VolatileCaches>,
    items: Arc<ItemCache>,
}

impl Default for CacheSet {
    fn default() -> Self {
        Self {
            volatile: RwLock::new(VolatileCaches {
                names: Arc::new(NameCache::new()),
                results: Arc::new(ResultCache::new()),
            }),
            items: Arc::new(ItemCache::new()),
        }
    }
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a consistent snapshot for one request. The snapshot stays
    /// usable even if a reset happens while the request runs.
    pub fn snapshot(&self) -> CacheSnapshot {
        let volatile = self.volatile.read().unwrap_or_else(|e| e.into_inner());
        CacheSnapshot {
            names: Arc::clone(&volatile.names),
            results: Arc::clone(&volatile.results),
            items: Arc::clone(&self.items),
        }
    }

    /// Discard the name and result caches. The item cache is retained:
    /// deduplicated items are content-addressed and stay valid across
    /// generations.
    pub fn reset(&self) {
        let mut volatile = self.volatile.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(
            names = volatile.names.len(),
            results = volatile.results.len(),
            "resetting volatile caches"
        );
        *volatile = VolatileCaches {
            names: Arc::new(NameCache::new()),
            results: Arc::new(ResultCache::new()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str) -> Item {
        Item::new(vec![("path".into(), path.into())])
    }

    #[test]
    fn intern_shares_allocation() {
        let cache = NameCache::new();
        let a = cache.intern("filepath");
        let b = cache.intern("filepath");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let c = cache.intern("filename");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn result_cache_keyed_by_id_and_flags() {
        let cache = ResultCache::new();
        let items = vec![Arc::new(item("/etc/passwd"))];
        cache.put("obj:1", 0, items.clone());

        assert!(cache.get("obj:1", 0).is_some());
        assert!(cache.get("obj:1", 2).is_none());
        assert!(cache.get("obj:2", 0).is_none());
    }

    #[test]
    fn item_dedup_by_content() {
        let cache = ItemCache::new();
        let a = cache.dedup(item("/etc/passwd"));
        let b = cache.dedup(item("/etc/passwd"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let c = cache.dedup(item("/etc/shadow"));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reset_discards_volatile_retains_items() {
        let set = CacheSet::new();
        let snap = set.snapshot();
        snap.names.intern("path");
        snap.results.put("obj:1", 0, vec![]);
        let shared = snap.items.dedup(item("/etc/passwd"));

        set.reset();
        let fresh = set.snapshot();
        assert!(fresh.names.is_empty());
        assert!(fresh.results.is_empty());
        // Item cache survives, same allocation comes back.
        let again = fresh.items.dedup(item("/etc/passwd"));
        assert!(Arc::ptr_eq(&shared, &again));
    }

    #[test]
    fn in_flight_snapshot_survives_reset() {
        let set = CacheSet::new();
        let before = set.snapshot();
        before.results.put("obj:1", 0, vec![Arc::new(item("/a"))]);

        set.reset();

        // The old generation is still readable through the held snapshot.
        assert!(before.results.get("obj:1", 0).is_some());
        // New snapshots see the fresh generation.
        assert!(set.snapshot().results.get("obj:1", 0).is_none());
    }
}
