//! Byte-budgeted LRU caches with hit-count admission.
//!
//! Three instances serve the query path: [`IdSetCache`] memoizes
//! materialized posting unions per `(condition, sort space, values)`,
//! [`QueryCache`] keeps cached total counts per structural query
//! fingerprint, and [`JoinCache`] memoizes inner join evaluations per
//! outer row key.
//!
//! Admission is hit-count based: the first lookup of a key only registers
//! interest, and the caller is asked to compute-and-put only once the key
//! has been seen `HIT_COUNT_TO_CACHE` times. One-shot scans therefore
//! never churn the budget.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use memdb_types::{CondType, IdType, KeyValue};

use crate::idset::IdSet;

/// Lookups a key must accumulate before the cache admits its value.
pub const HIT_COUNT_TO_CACHE: u64 = 2;

/// Default byte budget per cache instance.
pub const DEFAULT_CACHE_SIZE: usize = 8 * 1024 * 1024;

/// Values report their heap footprint for the byte budget.
pub trait CacheValue: Clone {
    fn size(&self) -> usize;
}

/// Outcome of a cache lookup.
#[derive(Debug, PartialEq)]
pub enum CacheHit<V> {
    /// Value served from the cache.
    Hit(V),
    /// The key is hot; compute the value and [`LruCache::put`] it back.
    NeedPut,
    /// Cold key; interest registered, nothing else to do.
    Miss,
}

#[derive(Debug)]
struct Entry<V> {
    value: Option<V>,
    hits: u64,
    last_used: u64,
    size: usize,
}

#[derive(Debug)]
struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    total_size: usize,
    tick: u64,
}

/// Cache statistics (atomic, readable without the cache lock).
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Size-bounded LRU map with hit-count admission.
#[derive(Debug)]
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_size: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V: CacheValue> LruCache<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                total_size: 0,
                tick: 0,
            }),
            max_size,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &K) -> CacheHit<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.hits += 1;
                entry.last_used = tick;
                match &entry.value {
                    Some(value) => {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        CacheHit::Hit(value.clone())
                    }
                    None if entry.hits >= HIT_COUNT_TO_CACHE => CacheHit::NeedPut,
                    None => {
                        self.stats.misses.fetch_add(1, Ordering::Relaxed);
                        CacheHit::Miss
                    }
                }
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                inner.map.insert(
                    key.clone(),
                    Entry {
                        value: None,
                        hits: 1,
                        last_used: tick,
                        size: 0,
                    },
                );
                CacheHit::Miss
            }
        }
    }

    /// Store a computed value for a key.
    pub fn put(&self, key: K, value: V) {
        let size = value.size();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.map.get_mut(&key) {
            inner.total_size = inner.total_size - entry.size + size;
            entry.value = Some(value);
            entry.size = size;
            entry.last_used = tick;
        } else {
            inner.total_size += size;
            inner.map.insert(
                key,
                Entry {
                    value: Some(value),
                    hits: HIT_COUNT_TO_CACHE,
                    last_used: tick,
                    size,
                },
            );
        }
        while inner.total_size > self.max_size {
            let victim = inner
                .map
                .iter()
                .filter(|(_, e)| e.value.is_some())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(e) = inner.map.remove(&k) {
                        inner.total_size -= e.size;
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.total_size = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held by admitted values.
    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl CacheValue for Arc<IdSet> {
    fn size(&self) -> usize {
        std::mem::size_of::<IdSet>() + self.heap_size()
    }
}

/// Key of a materialized posting union: condition, sort space and the
/// ordered value list all participate in the hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdSetCacheKey {
    pub cond: CondType,
    pub sort_id: u32,
    pub values: Vec<KeyValue>,
}

/// Predicate -> materialized IdSet.
pub type IdSetCache = LruCache<IdSetCacheKey, Arc<IdSet>>;

/// Cached total count of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalCount {
    pub total_count: usize,
}

impl CacheValue for TotalCount {
    fn size(&self) -> usize {
        std::mem::size_of::<TotalCount>()
    }
}

/// Query fingerprint -> total count.
pub type QueryCache = LruCache<u64, TotalCount>;

/// Key of a memoized inner join evaluation: the inner query fingerprint
/// plus the outer row's join-field values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinCacheKey {
    pub fingerprint: u64,
    pub outer_values: Vec<KeyValue>,
}

/// Memoized verdict and matched inner ids for one outer row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinCacheVal {
    pub matched: bool,
    pub ids: Vec<IdType>,
}

impl CacheValue for JoinCacheVal {
    fn size(&self) -> usize {
        std::mem::size_of::<JoinCacheVal>() + self.ids.capacity() * std::mem::size_of::<IdType>()
    }
}

pub type JoinCache = LruCache<JoinCacheKey, JoinCacheVal>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_after_hits() {
        let cache: QueryCache = LruCache::new(1024);
        // First sight: cold miss.
        assert_eq!(cache.get(&1), CacheHit::Miss);
        // Second sight: hot, caller should compute and put.
        assert_eq!(cache.get(&1), CacheHit::NeedPut);
        cache.put(1, TotalCount { total_count: 7 });
        assert_eq!(cache.get(&1), CacheHit::Hit(TotalCount { total_count: 7 }));
    }

    #[test]
    fn test_byte_budget_eviction() {
        let cache: IdSetCache = LruCache::new(256);
        for i in 0..16 {
            let key = IdSetCacheKey {
                cond: CondType::Eq,
                sort_id: 0,
                values: vec![KeyValue::Int(i)],
            };
            cache.put(key, Arc::new(IdSet::from_vec((0..16).collect())));
        }
        assert!(cache.total_size() <= 256 || cache.stats().evictions() > 0);
        assert!(cache.stats().evictions() > 0);
    }

    #[test]
    fn test_lru_order() {
        let cache: QueryCache = LruCache::new(2 * std::mem::size_of::<TotalCount>());
        cache.put(1, TotalCount { total_count: 1 });
        cache.put(2, TotalCount { total_count: 2 });
        // Touch 1 so 2 becomes the LRU victim.
        assert!(matches!(cache.get(&1), CacheHit::Hit(_)));
        cache.put(3, TotalCount { total_count: 3 });
        assert!(matches!(cache.get(&1), CacheHit::Hit(_)));
        assert!(!matches!(cache.get(&2), CacheHit::Hit(_)));
    }

    #[test]
    fn test_clear() {
        let cache: QueryCache = LruCache::new(1024);
        cache.put(1, TotalCount { total_count: 1 });
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
    }
}
