//! Engine-wide configuration, collecting every default named in the design
//! across the extent engine (C4), write buffer (C2), columnar checkpointer
//! (C6) and tiered router (C7).

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    None,
    Gzip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentConfig {
    pub page_size: u32,
    pub extent_size: u32,
    pub compression: CompressionKind,
    pub key_prefix: String,
    pub auto_flush: bool,
    /// `None` means derive from `page_size`/`extent_size` via
    /// `floor((extent_size - 64) / (page_size + 0.125))`.
    pub flush_threshold: Option<u32>,
    pub extent_cache_capacity: usize,
}

impl Default for ExtentConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            extent_size: 2 * 1024 * 1024,
            compression: CompressionKind::None,
            key_prefix: "extent/".to_string(),
            auto_flush: true,
            flush_threshold: None,
            extent_cache_capacity: 16,
        }
    }
}

impl ExtentConfig {
    /// Maximum number of pages that fit in one extent, accounting for the
    /// 1-bit-per-page bitmap amortized over the page size.
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        if let Some(t) = self.flush_threshold {
            return t as usize;
        }
        let numerator = f64::from(self.extent_size) - 64.0;
        let denominator = f64::from(self.page_size) + 0.125;
        (numerator / denominator).floor().max(1.0) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBufferConfig {
    pub max_count: usize,
    pub max_bytes: u64,
    pub default_ttl_secs: u64,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self { max_count: 500, max_bytes: 25 * 1024 * 1024, default_ttl_secs: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub count_threshold: usize,
    pub memory_ratio: f64,
    pub interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { count_threshold: 10, memory_ratio: 0.8, interval_ms: 5000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicyConfig {
    pub hot_max_age_days: u32,
    pub warm_max_age_days: u32,
    pub auto_promote: bool,
    pub auto_demote: bool,
    pub min_access_count_to_promote: u32,
    pub max_promotions_per_run: usize,
}

impl Default for TierPolicyConfig {
    fn default() -> Self {
        Self {
            hot_max_age_days: 1,
            warm_max_age_days: 30,
            auto_promote: true,
            auto_demote: true,
            min_access_count_to_promote: 2,
            max_promotions_per_run: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: Option<u64>,
    pub max_log_entries: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay_ms: 10, timeout_ms: None, max_log_entries: 100 }
    }
}

/// Byte-size threshold above which a blob write is delegated to the extent
/// engine rather than stored inline on the blob row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub chunking_threshold_bytes: u64,
    pub extent: ExtentConfig,
    pub write_buffer: WriteBufferConfig,
    pub checkpoint: CheckpointConfig,
    pub tier_policy: TierPolicyConfig,
    pub transaction: TransactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking_threshold_bytes: 256 * 1024,
            extent: ExtentConfig::default(),
            write_buffer: WriteBufferConfig::default(),
            checkpoint: CheckpointConfig::default(),
            tier_policy: TierPolicyConfig::default(),
            transaction: TransactionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse as TOML.
    pub fn from_toml_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Overrides fields from `FSX_*` environment variables, applied on top of
    /// whatever configuration is already present (defaults or a loaded file).
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("FSX_PAGE_SIZE")
            && let Ok(n) = v.parse()
        {
            self.extent.page_size = n;
        }
        if let Ok(v) = std::env::var("FSX_EXTENT_SIZE")
            && let Ok(n) = v.parse()
        {
            self.extent.extent_size = n;
        }
        if let Ok(v) = std::env::var("FSX_CHUNK_THRESHOLD")
            && let Ok(n) = v.parse()
        {
            self.chunking_threshold_bytes = n;
        }
        if let Ok(v) = std::env::var("FSX_AUTO_FLUSH") {
            self.extent.auto_flush = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        self
    }
}
