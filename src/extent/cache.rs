//! In-memory extent cache keyed by extent id. Promoted into on every
//! backend fetch in the read path; evicted least-recently-used once the
//! configured capacity is exceeded.

use crate::extent::format::{self, ExtentHeader};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

#[derive(Clone)]
pub struct CachedExtent {
    pub bytes: std::sync::Arc<Vec<u8>>,
    pub header: ExtentHeader,
}

pub struct ExtentCache {
    store: Mutex<LruCache<String, CachedExtent>>,
}

impl ExtentCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { store: Mutex::new(LruCache::new(cap)) }
    }

    /// Parses and inserts `bytes` under `extent_id`, returning the parsed
    /// entry. Returns `None` if the header cannot be parsed (caller should
    /// treat this as corruption, not cache it).
    pub fn insert(&self, extent_id: &str, bytes: Vec<u8>) -> Option<CachedExtent> {
        let header = format::parse_header(&bytes).ok()?;
        let entry = CachedExtent { bytes: std::sync::Arc::new(bytes), header };
        self.store.lock().put(extent_id.to_string(), entry.clone());
        Some(entry)
    }

    /// Looks up `extent_id`, refreshing its recency on hit.
    pub fn get(&self, extent_id: &str) -> Option<CachedExtent> {
        self.store.lock().get(extent_id).cloned()
    }

    /// Looks up `extent_id` without touching recency — used by the
    /// synchronous read variant, which must never promote or evict.
    pub fn peek(&self, extent_id: &str) -> Option<CachedExtent> {
        self.store.lock().peek(extent_id).cloned()
    }

    pub fn remove(&self, extent_id: &str) {
        self.store.lock().pop(extent_id);
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
