use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Used for every timestamp field named in
/// the data model (Entry's four timestamps, Blob's creation time, dirty-page
/// and extent-file modification times).
pub type TimestampMs = i64;

#[must_use]
pub fn now_ms() -> TimestampMs {
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    i64::try_from(dur.as_millis()).unwrap_or(i64::MAX)
}

/// Coarse latency/cost class recorded on both Entries and Blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "hot" => Some(Self::Hot),
            "warm" => Some(Self::Warm),
            "cold" => Some(Self::Cold),
            _ => None,
        }
    }
}

impl rusqlite::types::ToSql for Tier {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
    }
}

impl rusqlite::types::FromSql for Tier {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::from_str(s).ok_or_else(|| rusqlite::types::FromSqlError::InvalidType)
    }
}

/// Kind of filesystem node an Entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "directory" => Some(Self::Directory),
            "symlink" => Some(Self::Symlink),
            _ => None,
        }
    }
}

impl rusqlite::types::ToSql for EntryKind {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
    }
}

impl rusqlite::types::FromSql for EntryKind {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::from_str(s).ok_or_else(|| rusqlite::types::FromSqlError::InvalidType)
    }
}

/// Status of a transaction-log record (spec's `TransactionLogRecord`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    TimedOut,
}

impl TransactionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::TimedOut => "timed_out",
        }
    }
}

/// One entry in the bounded transaction log kept by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogRecord {
    pub id: u128,
    pub status: TransactionStatus,
    pub started_at: TimestampMs,
    pub ended_at: Option<TimestampMs>,
    pub operation_count: u64,
    pub retry_count: u32,
    pub rollback_reason: Option<String>,
}

/// A random 128-bit id, used for transaction ids. Built from two UUIDv4
/// halves rather than pulling in a raw RNG dependency of its own.
#[must_use]
pub fn random_u128() -> u128 {
    let hi = uuid::Uuid::new_v4().as_u128();
    let lo = uuid::Uuid::new_v4().as_u128();
    hi ^ lo.rotate_left(64)
}
