//! Caching layer for frequently accessed chain data
//!
//! Blocks are immutable once stored, so a block read through the cache can never go
//! stale. Only the hash-to-block mapping is cached; balances always come from the store.
use crate::blockchain::Block;
use crate::crypto::Sha256Hash;
use lru::LruCache;
use parking_lot::RwLock;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generic, thread-safe LRU cache.
pub struct ThreadSafeCache<K: Hash + Eq, V> {
    cache: Arc<RwLock<LruCache<K, V>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl<K, V> ThreadSafeCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// A capacity of 0 is treated as 1.
    pub fn new_lru(capacity: usize) -> Self {
        let capacity_nz = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity_nz))),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.read().cap().get()
    }

    /// Looks up `key` and promotes it to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.cache.write().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Looks up `key` without touching recency or statistics.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.cache.read().peek(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.cache.write().put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.cache.write().pop(key)
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<K: Hash + Eq, V> Clone for ThreadSafeCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            hits: Arc::clone(&self.hits),
            misses: Arc::clone(&self.misses),
        }
    }
}

/// Cache for recently read or appended blocks
pub type BlockCache = ThreadSafeCache<Sha256Hash, Block>;

impl BlockCache {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self::new_lru(capacity)
    }

    pub fn insert_block(&self, block: &Block) {
        self.put(block.header.hash, block.clone());
    }

    /// `(entries, capacity)`
    pub fn stats(&self) -> (usize, usize) {
        (self.len(), self.capacity())
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
