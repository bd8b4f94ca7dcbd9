use crate::buffer::config::{BufferConfig, EvictReason};
use crate::buffer::metrics::{BufferMetrics, BufferStats};
use crate::buffer::policy::is_expired;
use crate::buffer::size::estimate_size;
use lru::LruCache;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Slot<V> {
    value: V,
    size: u64,
    expires_at: Option<Instant>,
}

pub type EvictCallback<V> = Arc<dyn Fn(&str, &V, EvictReason) + Send + Sync>;

/// Options for [`WriteBuffer::set`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub mark_dirty: bool,
}

impl SetOptions {
    #[must_use]
    pub fn dirty() -> Self {
        Self { ttl: None, mark_dirty: true }
    }
}

/// A bounded, size- and count-limited, TTL-aware, dirty-tracking LRU used by
/// both the extent engine's extent cache and the columnar checkpointer's
/// entity cache.
pub struct WriteBuffer<V> {
    store: RwLock<LruCache<String, Slot<V>>>,
    dirty: RwLock<HashSet<String>>,
    config: RwLock<BufferConfig>,
    total_bytes: AtomicU64,
    metrics: BufferMetrics,
    on_evict: RwLock<Option<EvictCallback<V>>>,
}

impl<V: Clone + Serialize> WriteBuffer<V> {
    #[must_use]
    pub fn new(config: BufferConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_count.max(1)).unwrap();
        Self {
            store: RwLock::new(LruCache::new(cap)),
            dirty: RwLock::new(HashSet::new()),
            config: RwLock::new(config),
            total_bytes: AtomicU64::new(0),
            metrics: BufferMetrics::default(),
            on_evict: RwLock::new(None),
        }
    }

    pub fn set_evict_callback(&self, cb: EvictCallback<V>) {
        *self.on_evict.write() = Some(cb);
    }

    fn notify_evict(&self, key: &str, value: &V, reason: EvictReason) {
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = self.on_evict.read().as_ref() {
            cb(key, value, reason);
        }
    }

    fn default_ttl(&self) -> Option<Duration> {
        let secs = self.config.read().default_ttl_secs;
        if secs == 0 { None } else { Some(Duration::from_secs(secs)) }
    }

    /// Inserts `value` under `key`, evicting least-recently-used entries as
    /// needed to satisfy the count and byte-budget invariants.
    pub fn set(&self, key: &str, value: V, opts: SetOptions) {
        let size = estimate_size(&value) as u64;
        let ttl = opts.ttl.or_else(|| self.default_ttl());
        let expires_at = ttl.map(|d| Instant::now() + d);

        {
            let mut store = self.store.write();
            if let Some(old) = store.peek(key) {
                self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
            }
        }

        self.evict_for_incoming(size);

        {
            let mut store = self.store.write();
            store.put(key.to_string(), Slot { value, size, expires_at });
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        if opts.mark_dirty {
            self.dirty.write().insert(key.to_string());
        }
    }

    fn evict_for_incoming(&self, incoming_size: u64) {
        let (max_count, max_bytes) = {
            let cfg = self.config.read();
            (cfg.max_count, cfg.max_bytes)
        };
        loop {
            let (len, cap, total) = {
                let store = self.store.read();
                (store.len(), store.cap().get(), self.total_bytes.load(Ordering::Relaxed))
            };
            let over_count = len >= max_count || len >= cap;
            let over_bytes = total + incoming_size > max_bytes && len > 0;
            if !over_count && !over_bytes {
                break;
            }
            let victim = {
                let mut store = self.store.write();
                store.pop_lru()
            };
            let Some((key, slot)) = victim else { break };
            self.total_bytes.fetch_sub(slot.size, Ordering::Relaxed);
            self.dirty.write().remove(&key);
            let reason = if over_count { EvictReason::Count } else { EvictReason::Size };
            self.notify_evict(&key, &slot.value, reason);
        }
    }

    /// Retrieves `key`, updating recency. Lazily evicts TTL-expired entries:
    /// per the write-buffer contract, an expired hit still increments the
    /// hit counter even though the returned value is absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut store = self.store.write();
        match store.get(key) {
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(slot) if is_expired(slot.expires_at, now) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(s) = store.pop(key) {
                    drop(store);
                    self.total_bytes.fetch_sub(s.size, Ordering::Relaxed);
                    self.dirty.write().remove(key);
                    self.notify_evict(key, &s.value, EvictReason::Expired);
                }
                None
            }
            Some(slot) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value.clone())
            }
        }
    }

    /// Removes `key`, emitting an eviction callback with reason `Deleted`.
    pub fn delete(&self, key: &str) -> Option<V> {
        let popped = self.store.write().pop(key);
        let Some(slot) = popped else { return None };
        self.total_bytes.fetch_sub(slot.size, Ordering::Relaxed);
        self.dirty.write().remove(key);
        self.notify_evict(key, &slot.value, EvictReason::Deleted);
        Some(slot.value)
    }

    /// Returns the current dirty snapshot, excluding expired entries.
    pub fn dirty_entries(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        let store = self.store.read();
        let dirty = self.dirty.read();
        dirty
            .iter()
            .filter_map(|k| {
                store.peek(k).and_then(|slot| {
                    if is_expired(slot.expires_at, now) { None } else { Some((k.clone(), slot.value.clone())) }
                })
            })
            .collect()
    }

    /// Clears the dirty bit for each key and increments the checkpoint
    /// counter once.
    pub fn mark_clean(&self, keys: &[String]) {
        let mut dirty = self.dirty.write();
        for k in keys {
            dirty.remove(k);
        }
        self.metrics.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears every entry, evicting each with reason `Cleared`.
    pub fn clear(&self) {
        let entries: Vec<(String, Slot<V>)> = {
            let mut store = self.store.write();
            let mut out = Vec::with_capacity(store.len());
            while let Some(e) = store.pop_lru() {
                out.push(e);
            }
            out
        };
        self.total_bytes.store(0, Ordering::Relaxed);
        self.dirty.write().clear();
        for (k, slot) in entries {
            self.notify_evict(&k, &slot.value, EvictReason::Cleared);
        }
    }

    pub fn stats(&self) -> BufferStats {
        let (count, max_bytes) = {
            let store = self.store.read();
            (store.len(), self.config.read().max_bytes)
        };
        let dirty_count = self.dirty.read().len();
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        self.metrics.snapshot(count, total_bytes, max_bytes, dirty_count)
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_get_roundtrip() {
        let buf: WriteBuffer<i32> = WriteBuffer::new(BufferConfig::default());
        buf.set("a", 1, SetOptions::dirty());
        assert_eq!(buf.get("a"), Some(1));
        assert_eq!(buf.get("missing"), None);
    }

    #[test]
    fn count_eviction_respects_max_count() {
        let cfg = BufferConfig { max_count: 2, max_bytes: u64::MAX, default_ttl_secs: 0 };
        let buf: WriteBuffer<i32> = WriteBuffer::new(cfg);
        buf.set("a", 1, SetOptions::dirty());
        buf.set("b", 2, SetOptions::dirty());
        buf.set("c", 3, SetOptions::dirty());
        assert!(buf.len() <= 2);
        assert_eq!(buf.get("c"), Some(3));
    }

    #[test]
    fn dirty_tracking_and_mark_clean() {
        let buf: WriteBuffer<i32> = WriteBuffer::new(BufferConfig::default());
        buf.set("a", 1, SetOptions::dirty());
        buf.set("b", 2, SetOptions { ttl: None, mark_dirty: false });
        let dirty = buf.dirty_entries();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, "a");
        buf.mark_clean(&["a".to_string()]);
        assert!(buf.dirty_entries().is_empty());
        assert_eq!(buf.stats().checkpoints, 1);
    }

    #[test]
    fn ttl_expiry_lazily_evicts_on_get() {
        let buf: WriteBuffer<i32> = WriteBuffer::new(BufferConfig::default());
        buf.set("a", 1, SetOptions { ttl: Some(Duration::from_millis(1)), mark_dirty: true });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(buf.get("a"), None);
        assert_eq!(buf.stats().hits, 1);
        assert_eq!(buf.stats().count, 0);
    }

    #[test]
    fn delete_invokes_callback_with_reason() {
        let buf: WriteBuffer<i32> = WriteBuffer::new(BufferConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        buf.set_evict_callback(Arc::new(move |_k, _v, reason| {
            if reason == EvictReason::Deleted {
                seen2.fetch_add(1, Ordering::Relaxed);
            }
        }));
        buf.set("a", 1, SetOptions::dirty());
        assert_eq!(buf.delete("a"), Some(1));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn invariant_sum_of_sizes_equals_total_bytes() {
        let buf: WriteBuffer<String> = WriteBuffer::new(BufferConfig::default());
        for i in 0..20 {
            buf.set(&format!("k{i}"), format!("value-{i}"), SetOptions::dirty());
        }
        let stats = buf.stats();
        let store = buf.store.read();
        let sum: u64 = store.iter().map(|(_, s)| s.size).sum();
        assert_eq!(sum, stats.total_bytes);
        assert!(stats.count <= buf.config.read().max_count);
    }
}
