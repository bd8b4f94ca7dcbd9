use crate::types::{Tier, TimestampMs};

#[derive(Debug, Clone)]
pub struct Blob {
    pub id: String,
    pub tier: Tier,
    pub size: u64,
    pub checksum: Option<String>,
    pub created_at: TimestampMs,
    pub ref_count: i64,
    pub is_chunked: bool,
    pub page_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct NewBlob {
    pub id: String,
    pub tier: Tier,
    pub size: u64,
    pub checksum: Option<String>,
    pub is_chunked: bool,
    pub page_keys: Option<Vec<String>>,
}
