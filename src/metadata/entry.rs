use crate::types::{EntryKind, Tier, TimestampMs};

#[derive(Debug, Clone)]
pub struct Entry {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub parent_id: Option<i64>,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blob_id: Option<String>,
    pub link_target: Option<String>,
    pub tier: Tier,
    pub atime: TimestampMs,
    pub mtime: TimestampMs,
    pub ctime: TimestampMs,
    pub birthtime: TimestampMs,
    pub nlink: u32,
}

/// Fields supplied when creating a new entry. Timestamps default to "now"
/// when left unset.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub path: String,
    pub name: String,
    pub parent_id: Option<i64>,
    pub kind: Option<EntryKind>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub blob_id: Option<String>,
    pub link_target: Option<String>,
    pub tier: Option<Tier>,
}

/// Partial update applied by `update_entry`. `None` fields are left
/// untouched; `ctime` always advances regardless of which fields changed.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub path: Option<String>,
    pub parent_id: Option<i64>,
    pub size: Option<u64>,
    pub tier: Option<Tier>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<TimestampMs>,
    pub mtime: Option<TimestampMs>,
    pub blob_id: Option<Option<String>>,
}
