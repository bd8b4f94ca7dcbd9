//! Page-addressable byte store over a stable `file_id` namespace (C4):
//! `extent_files`/`extents`/`dirty_pages` SQL tables plus a blob backend
//! (C8), fronted by an in-memory extent cache.

use crate::backend::BlobBackend;
use crate::config::{CompressionKind, ExtentConfig};
use crate::errors::{EngineError, Result};
use crate::extent::cache::ExtentCache;
use crate::extent::format::{self, FLAG_COMPRESSED};
use crate::sql::SqlConn;
use crate::types::now_ms;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ExtentEngine {
    conn: Arc<SqlConn>,
    backend: Arc<dyn BlobBackend>,
    cache: ExtentCache,
    config: ExtentConfig,
}

fn pages_per_extent(cfg: &ExtentConfig) -> u32 {
    (cfg.extent_size / cfg.page_size).max(1)
}

fn extent_key(cfg: &ExtentConfig, extent_id: &str) -> String {
    format!("{}{}", cfg.key_prefix, extent_id)
}

impl ExtentEngine {
    #[must_use]
    pub fn new(conn: Arc<SqlConn>, backend: Arc<dyn BlobBackend>, config: ExtentConfig) -> Self {
        let cache = ExtentCache::new(config.extent_cache_capacity);
        Self { conn, backend, cache, config }
    }

    /// Creates the `extent_files`, `extents` and `dirty_pages` tables if
    /// absent.
    ///
    /// # Errors
    /// Returns an error if the DDL statements fail.
    pub fn init(&self) -> Result<()> {
        self.conn.with(|c| {
            c.execute_batch(
                "CREATE TABLE IF NOT EXISTS extent_files (
                    file_id TEXT PRIMARY KEY,
                    page_size INTEGER NOT NULL,
                    file_size INTEGER NOT NULL DEFAULT 0,
                    extent_count INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    modified_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS extents (
                    extent_id TEXT PRIMARY KEY,
                    file_id TEXT NOT NULL,
                    extent_index INTEGER NOT NULL,
                    start_page INTEGER NOT NULL,
                    page_count INTEGER NOT NULL,
                    compressed INTEGER NOT NULL,
                    original_size INTEGER NOT NULL,
                    stored_size INTEGER NOT NULL,
                    checksum TEXT NOT NULL,
                    UNIQUE(file_id, extent_index)
                );
                CREATE INDEX IF NOT EXISTS idx_extents_file_start ON extents(file_id, start_page);
                CREATE TABLE IF NOT EXISTS dirty_pages (
                    file_id TEXT NOT NULL,
                    page_num INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    modified_at INTEGER NOT NULL,
                    PRIMARY KEY(file_id, page_num)
                );",
            )
        })?;
        Ok(())
    }

    fn ensure_file_row(&self, file_id: &str) -> Result<()> {
        let now = now_ms();
        self.conn.with(|c| {
            c.execute(
                "INSERT OR IGNORE INTO extent_files(file_id, page_size, file_size, extent_count, created_at, modified_at)
                 VALUES (?1, ?2, 0, 0, ?3, ?3)",
                rusqlite::params![file_id, self.config.page_size, now],
            )
        })?;
        Ok(())
    }

    fn file_size(&self, file_id: &str) -> Result<u64> {
        let size: Option<i64> = self
            .conn
            .with(|c| c.query_row("SELECT file_size FROM extent_files WHERE file_id = ?1", [file_id], |r| r.get(0)))
            .ok();
        Ok(size.unwrap_or(0) as u64)
    }

    fn set_file_size(&self, file_id: &str, size: u64) -> Result<()> {
        self.conn.with(|c| {
            c.execute(
                "UPDATE extent_files SET file_size = ?1, modified_at = ?2 WHERE file_id = ?3",
                rusqlite::params![size as i64, now_ms(), file_id],
            )
        })?;
        Ok(())
    }

    fn dirty_count(&self, file_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .with(|c| c.query_row("SELECT COUNT(*) FROM dirty_pages WHERE file_id = ?1", [file_id], |r| r.get(0)))?;
        Ok(count as usize)
    }

    /// Writes `data` (must be exactly `page_size` bytes) to `page_num` of
    /// `file_id`, upserting it into `dirty_pages` and advancing `file_size`.
    /// Triggers a flush of this file if auto-flush is enabled and the dirty
    /// count has reached the configured threshold.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `data.len() != page_size`, or propagates
    /// SQL/backend errors from a triggered flush.
    pub async fn write_page(&self, file_id: &str, page_num: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.config.page_size as usize {
            return Err(EngineError::InvalidArgument(format!(
                "page length {} does not match configured page size {}",
                data.len(),
                self.config.page_size
            )));
        }
        self.ensure_file_row(file_id)?;
        self.conn.with(|c| {
            c.execute(
                "INSERT INTO dirty_pages(file_id, page_num, data, modified_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_id, page_num) DO UPDATE SET data = excluded.data, modified_at = excluded.modified_at",
                rusqlite::params![file_id, page_num, data, now_ms()],
            )
        })?;

        let candidate_size = (u64::from(page_num) + 1) * u64::from(self.config.page_size);
        if candidate_size > self.file_size(file_id)? {
            self.set_file_size(file_id, candidate_size)?;
        }

        if self.config.auto_flush && self.dirty_count(file_id)? >= self.config.flush_threshold() {
            self.flush_file(file_id).await?;
        }
        Ok(())
    }

    fn dirty_page(&self, file_id: &str, page_num: u32) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = self
            .conn
            .with(|c| {
                c.query_row(
                    "SELECT data FROM dirty_pages WHERE file_id = ?1 AND page_num = ?2",
                    rusqlite::params![file_id, page_num],
                    |r| r.get(0),
                )
            })
            .ok();
        Ok(data)
    }

    fn locate_extent(&self, file_id: &str, page_num: u32) -> Result<Option<ExtentRow>> {
        let row = self
            .conn
            .with(|c| {
                c.query_row(
                    "SELECT extent_id, start_page, page_count FROM extents
                     WHERE file_id = ?1 AND start_page <= ?2 ORDER BY start_page DESC LIMIT 1",
                    rusqlite::params![file_id, page_num],
                    |r| {
                        Ok(ExtentRow {
                            extent_id: r.get(0)?,
                            start_page: r.get::<_, i64>(1)? as u32,
                            page_count: r.get::<_, i64>(2)? as u32,
                        })
                    },
                )
            })
            .ok();
        Ok(row.filter(|r| page_num < r.start_page + r.page_count))
    }

    async fn fetch_extent(&self, extent_id: &str) -> Result<crate::extent::cache::CachedExtent> {
        if let Some(cached) = self.cache.get(extent_id) {
            return Ok(cached);
        }
        let key = extent_key(&self.config, extent_id);
        let fetched = self
            .backend
            .get(&key)
            .await?
            .ok_or_else(|| EngineError::DataCorrupted(format!("extent blob missing from backend: {extent_id}")))?;
        if !format::validate(&fetched.data) {
            return Err(EngineError::DataCorrupted(format!("extent checksum mismatch: {extent_id}")));
        }
        self.cache
            .insert(extent_id, fetched.data)
            .ok_or_else(|| EngineError::DataCorrupted(format!("extent header unparseable: {extent_id}")))
    }

    /// Reads the page at `page_num` for `file_id`: dirty pages first, then
    /// committed extents (promoting the fetched blob into the extent
    /// cache). Returns `None` if the page has never been written.
    ///
    /// # Errors
    /// Returns `DataCorrupted` if the extent checksum does not validate, or
    /// propagates backend/SQL errors.
    pub async fn read_page(&self, file_id: &str, page_num: u32) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.dirty_page(file_id, page_num)? {
            return Ok(Some(data));
        }
        let Some(located) = self.locate_extent(file_id, page_num)? else { return Ok(None) };
        let cached = self.fetch_extent(&located.extent_id).await?;
        let page_index = page_num - located.start_page;
        Ok(format::extract_page(&cached.bytes, page_index))
    }

    /// Synchronous read variant: only satisfies the request from dirty
    /// pages or an already-cached extent; never awaits a backend fetch.
    ///
    /// # Errors
    /// Returns `DataCorrupted` if a cached extent fails checksum validation.
    pub fn read_page_sync(&self, file_id: &str, page_num: u32) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.dirty_page(file_id, page_num)? {
            return Ok(Some(data));
        }
        let Some(located) = self.locate_extent(file_id, page_num)? else { return Ok(None) };
        let Some(cached) = self.cache.peek(&located.extent_id) else { return Ok(None) };
        if !format::validate(&cached.bytes) {
            return Err(EngineError::DataCorrupted(format!("extent checksum mismatch: {}", located.extent_id)));
        }
        let page_index = page_num - located.start_page;
        Ok(format::extract_page(&cached.bytes, page_index))
    }

    /// Flushes every file with pending dirty pages.
    ///
    /// # Errors
    /// Propagates the first error from any per-file flush.
    pub async fn flush(&self) -> Result<()> {
        let file_ids: Vec<String> =
            self.conn.with(|c| {
                let mut stmt = c.prepare("SELECT DISTINCT file_id FROM dirty_pages")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })?;
        for file_id in file_ids {
            self.flush_file(&file_id).await?;
        }
        Ok(())
    }

    /// Flushes the dirty pages of a single file into one or more extents.
    ///
    /// # Errors
    /// Surfaces a failed `backend.put` to the caller without deleting the
    /// source dirty pages, so a subsequent flush can retry.
    pub async fn flush_file(&self, file_id: &str) -> Result<()> {
        let pages: Vec<(u32, Vec<u8>)> = self.conn.with(|c| {
            let mut stmt = c.prepare(
                "SELECT page_num, data FROM dirty_pages WHERE file_id = ?1 ORDER BY page_num",
            )?;
            let rows = stmt.query_map([file_id], |r| {
                Ok((r.get::<_, i64>(0)? as u32, r.get::<_, Vec<u8>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        if pages.is_empty() {
            return Ok(());
        }

        let per_extent = pages_per_extent(&self.config);
        let mut groups: BTreeMap<u32, BTreeMap<u32, Vec<u8>>> = BTreeMap::new();
        for (page_num, data) in pages {
            let extent_index = page_num / per_extent;
            let offset = page_num - extent_index * per_extent;
            groups.entry(extent_index).or_default().insert(offset, data);
        }

        for (extent_index, group) in groups {
            let start_page = extent_index * per_extent;
            self.write_extent(file_id, &group, extent_index, start_page).await?;
            self.conn.with(|c| {
                c.execute(
                    "DELETE FROM dirty_pages WHERE file_id = ?1 AND page_num >= ?2 AND page_num < ?3",
                    rusqlite::params![file_id, start_page, start_page + per_extent],
                )
            })?;
        }

        self.recount_extents(file_id)?;
        Ok(())
    }

    async fn write_extent(
        &self,
        file_id: &str,
        group: &BTreeMap<u32, Vec<u8>>,
        extent_index: u32,
        start_page: u32,
    ) -> Result<()> {
        let flags = if self.config.compression != CompressionKind::None { FLAG_COMPRESSED } else { 0 };
        let blob = format::build(group, self.config.page_size, flags)
            .map_err(|e| EngineError::InvalidFormat(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&blob);
        let digest = hasher.finalize();
        let extent_id = format!("ext-{}", &hex::encode(digest)[..32]);

        let key = extent_key(&self.config, &extent_id);
        if let Err(e) = self.backend.put(&key, &blob).await {
            log::error!("flush write failed for extent {extent_id} (file {file_id}): {e}");
            return Err(e);
        }

        let existing: Option<String> = self
            .conn
            .with(|c| {
                c.query_row(
                    "SELECT extent_id FROM extents WHERE file_id = ?1 AND extent_index = ?2",
                    rusqlite::params![file_id, extent_index],
                    |r| r.get(0),
                )
            })
            .ok();
        if let Some(old_id) = &existing
            && old_id != &extent_id
        {
            let old_key = extent_key(&self.config, old_id);
            if let Err(e) = self.backend.delete(&old_key).await {
                log::warn!("failed to delete superseded extent {old_id}: {e}");
            }
            self.cache.remove(old_id);
        }

        let header = format::parse_header(&blob).map_err(|e| EngineError::InvalidFormat(e.to_string()))?;
        let page_count = header.page_count;
        let original_size = group.len() as u64 * u64::from(self.config.page_size);
        let stored_size = blob.len() as u64;
        let checksum = hex::encode(header.checksum.to_le_bytes());

        self.conn.with(|c| {
            c.execute(
                "INSERT INTO extents(extent_id, file_id, extent_index, start_page, page_count, compressed, original_size, stored_size, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(file_id, extent_index) DO UPDATE SET
                    extent_id = excluded.extent_id, start_page = excluded.start_page,
                    page_count = excluded.page_count, compressed = excluded.compressed,
                    original_size = excluded.original_size, stored_size = excluded.stored_size,
                    checksum = excluded.checksum",
                rusqlite::params![
                    extent_id,
                    file_id,
                    extent_index,
                    start_page,
                    page_count,
                    i32::from(self.config.compression != CompressionKind::None),
                    original_size as i64,
                    stored_size as i64,
                    checksum,
                ],
            )
        })?;

        self.cache.insert(&extent_id, blob);
        Ok(())
    }

    fn recount_extents(&self, file_id: &str) -> Result<()> {
        let count: i64 =
            self.conn.with(|c| c.query_row("SELECT COUNT(*) FROM extents WHERE file_id = ?1", [file_id], |r| r.get(0)))?;
        self.conn.with(|c| {
            c.execute(
                "UPDATE extent_files SET extent_count = ?1, modified_at = ?2 WHERE file_id = ?3",
                rusqlite::params![count, now_ms(), file_id],
            )
        })?;
        Ok(())
    }

    /// Truncates `file_id` to `size`, deleting dirty pages and extents past
    /// the new last page, re-materializing the partially-retained extent's
    /// pages back into `dirty_pages`, and zero-padding a trailing partial
    /// page.
    ///
    /// # Errors
    /// Propagates SQL, backend, or checksum errors encountered while
    /// re-materializing a partially-truncated extent.
    pub async fn truncate(&self, file_id: &str, size: u64) -> Result<()> {
        let current_size = self.file_size(file_id)?;
        if size >= current_size {
            self.set_file_size(file_id, size)?;
            return Ok(());
        }

        let page_size = u64::from(self.config.page_size);
        let last_page: i64 = if size > 0 { (size.div_ceil(page_size) - 1) as i64 } else { -1 };

        self.conn.with(|c| {
            c.execute("DELETE FROM dirty_pages WHERE file_id = ?1 AND page_num > ?2", rusqlite::params![file_id, last_page])
        })?;

        let rows: Vec<ExtentRow> = self.conn.with(|c| {
            let mut stmt = c.prepare(
                "SELECT extent_id, start_page, page_count FROM extents WHERE file_id = ?1 ORDER BY start_page ASC",
            )?;
            let rows = stmt.query_map([file_id], |r| {
                Ok(ExtentRow {
                    extent_id: r.get(0)?,
                    start_page: r.get::<_, i64>(1)? as u32,
                    page_count: r.get::<_, i64>(2)? as u32,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for row in rows {
            let start = i64::from(row.start_page);
            let end_inclusive = start + i64::from(row.page_count) - 1;
            if start > last_page {
                self.delete_extent_row(file_id, &row).await?;
            } else if start <= last_page && last_page < end_inclusive {
                self.rematerialize_range(file_id, &row, row.start_page, last_page as u32).await?;
                self.delete_extent_row(file_id, &row).await?;
            }
            // else: fully below last_page, keep as-is.
        }

        if size > 0 && size % page_size != 0 {
            let last_page_u32 = last_page as u32;
            let existing = self.read_page(file_id, last_page_u32).await?.unwrap_or_else(|| vec![0u8; self.config.page_size as usize]);
            let keep = (size % page_size) as usize;
            let mut padded = vec![0u8; self.config.page_size as usize];
            padded[..keep.min(existing.len())].copy_from_slice(&existing[..keep.min(existing.len())]);
            self.write_page(file_id, last_page_u32, &padded).await?;
        }

        self.set_file_size(file_id, size)?;
        self.recount_extents(file_id)?;
        Ok(())
    }

    async fn rematerialize_range(&self, file_id: &str, row: &ExtentRow, start_page: u32, last_page: u32) -> Result<()> {
        let cached = self.fetch_extent(&row.extent_id).await?;
        for page_num in start_page..=last_page {
            let idx = page_num - row.start_page;
            if let Some(data) = format::extract_page(&cached.bytes, idx) {
                self.write_page(file_id, page_num, &data).await?;
            }
        }
        Ok(())
    }

    async fn delete_extent_row(&self, file_id: &str, row: &ExtentRow) -> Result<()> {
        let key = extent_key(&self.config, &row.extent_id);
        self.backend.delete(&key).await?;
        self.cache.remove(&row.extent_id);
        self.conn.with(|c| {
            c.execute("DELETE FROM extents WHERE file_id = ?1 AND extent_id = ?2", rusqlite::params![file_id, row.extent_id])
        })?;
        Ok(())
    }

    /// Deletes every extent blob and cache entry for `file_id`, then all
    /// rows across `extents`, `dirty_pages`, `extent_files`.
    ///
    /// # Errors
    /// Propagates backend or SQL errors.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let extent_ids: Vec<String> = self.conn.with(|c| {
            let mut stmt = c.prepare("SELECT extent_id FROM extents WHERE file_id = ?1")?;
            let rows = stmt.query_map([file_id], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        for extent_id in &extent_ids {
            let key = extent_key(&self.config, extent_id);
            self.backend.delete(&key).await?;
            self.cache.remove(extent_id);
        }
        self.conn.with(|c| c.execute("DELETE FROM extents WHERE file_id = ?1", [file_id]))?;
        self.conn.with(|c| c.execute("DELETE FROM dirty_pages WHERE file_id = ?1", [file_id]))?;
        self.conn.with(|c| c.execute("DELETE FROM extent_files WHERE file_id = ?1", [file_id]))?;
        Ok(())
    }
}

struct ExtentRow {
    extent_id: String,
    start_page: u32,
    page_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn engine() -> ExtentEngine {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        let backend: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let cfg = ExtentConfig { page_size: 64, extent_size: 64 * 4 + 64, flush_threshold: Some(4), ..ExtentConfig::default() };
        let engine = ExtentEngine::new(conn, backend, cfg);
        engine.init().unwrap();
        engine
    }

    #[tokio::test]
    async fn write_then_read_dirty_page() {
        let engine = engine();
        let page = vec![7u8; 64];
        engine.write_page("f1", 0, &page).await.unwrap();
        let read = engine.read_page("f1", 0).await.unwrap();
        assert_eq!(read, Some(page));
    }

    #[tokio::test]
    async fn auto_flush_triggers_at_threshold_and_read_survives() {
        let engine = engine();
        for i in 0..4u32 {
            engine.write_page("f1", i, &vec![i as u8; 64]).await.unwrap();
        }
        // threshold is 4, so the 4th write triggers a flush
        for i in 0..4u32 {
            let page = engine.read_page("f1", i).await.unwrap().unwrap();
            assert_eq!(page, vec![i as u8; 64]);
        }
    }

    #[tokio::test]
    async fn truncate_shrinks_and_zero_pads_partial_page() {
        let engine = engine();
        for i in 0..4u32 {
            engine.write_page("f1", i, &vec![9u8; 64]).await.unwrap();
        }
        engine.flush_file("f1").await.unwrap();
        engine.truncate("f1", 70).await.unwrap();
        let page1 = engine.read_page("f1", 1).await.unwrap().unwrap();
        assert_eq!(&page1[..6], &[9u8; 6]);
        assert!(page1[6..].iter().all(|&b| b == 0));
        assert!(engine.read_page("f1", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_file_removes_all_state() {
        let engine = engine();
        engine.write_page("f1", 0, &vec![1u8; 64]).await.unwrap();
        engine.flush_file("f1").await.unwrap();
        engine.delete_file("f1").await.unwrap();
        assert!(engine.read_page("f1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_page_rejects_wrong_length() {
        let engine = engine();
        let err = engine.write_page("f1", 0, &vec![1u8; 10]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
