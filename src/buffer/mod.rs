mod config;
mod core;
mod metrics;
mod policy;
mod size;

pub use config::{BufferConfig, EvictReason};
pub use core::{EvictCallback, SetOptions, WriteBuffer};
pub use metrics::{BufferMetrics, BufferStats};
