use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for a [`super::WriteBuffer`].
#[derive(Default)]
pub struct BufferMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub checkpoints: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub dirty_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub checkpoints: u64,
}

impl BufferStats {
    #[must_use]
    pub fn bytes_ratio(&self) -> f64 {
        if self.max_bytes == 0 { 0.0 } else { self.total_bytes as f64 / self.max_bytes as f64 }
    }
}

impl BufferMetrics {
    pub fn snapshot(&self, count: usize, total_bytes: u64, max_bytes: u64, dirty_count: usize) -> BufferStats {
        BufferStats {
            count,
            total_bytes,
            max_bytes,
            dirty_count,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}
