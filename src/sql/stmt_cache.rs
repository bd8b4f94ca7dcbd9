//! Prepared-statement cache (C3): a bounded LRU keyed by SQL text, with a
//! caller-supplied factory invoked exactly once per miss and a `finalize`
//! hook invoked exactly once per eviction.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Anything cacheable by [`StatementCache`] must know how to release its own
/// resources when evicted. Errors from `finalize` are swallowed by the
/// cache, matching the spec's "errors from finalize are swallowed" rule.
pub trait Finalizable {
    fn finalize(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StmtCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_created: u64,
    pub current_size: usize,
    pub max_size: usize,
}

impl StmtCacheStats {
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

pub struct StatementCache<T> {
    store: Mutex<LruCache<String, T>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    total_created: AtomicU64,
}

impl<T: Finalizable> StatementCache<T> {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let clamped = max_size.max(1);
        Self {
            store: Mutex::new(LruCache::new(NonZeroUsize::new(clamped).unwrap())),
            max_size: clamped,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
        }
    }

    /// Returns `true` if `sql` is currently cached, without touching
    /// recency.
    pub fn has(&self, sql: &str) -> bool {
        self.store.lock().contains(sql)
    }

    /// Returns the cached entry for `sql`, invoking `factory` on a miss. The
    /// factory is invoked exactly once per miss; any eviction caused by the
    /// resulting insert calls `finalize()` on the evicted entry.
    ///
    /// # Errors
    /// Propagates the factory's error on a miss; never errors on a hit.
    pub fn get_or_insert_with<E>(
        &self,
        sql: &str,
        factory: impl FnOnce() -> Result<T, E>,
    ) -> Result<(), E>
    where
        T: Clone,
    {
        {
            let mut store = self.store.lock();
            if store.get(sql).is_some() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = factory()?;
        self.total_created.fetch_add(1, Ordering::Relaxed);
        let mut store = self.store.lock();
        if store.len() >= self.max_size
            && !store.contains(sql)
            && let Some((_, mut evicted)) = store.pop_lru()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            let _ = evicted.finalize();
        }
        store.put(sql.to_string(), value);
        Ok(())
    }

    pub fn delete(&self, sql: &str) -> bool {
        let mut entry = self.store.lock().pop(sql);
        if let Some(v) = entry.as_mut() {
            let _ = v.finalize();
        }
        entry.is_some()
    }

    pub fn clear(&self) {
        let mut store = self.store.lock();
        while let Some((_, mut v)) = store.pop_lru() {
            let _ = v.finalize();
        }
    }

    pub fn stats(&self) -> StmtCacheStats {
        StmtCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            current_size: self.store.lock().len(),
            max_size: self.max_size,
        }
    }
}
