//! Transactional SQL-backed directory of filesystem entries and blobs (C5).

use crate::config::TransactionConfig;
use crate::errors::{EngineError, Result};
use crate::metadata::blob::{Blob, NewBlob};
use crate::metadata::entry::{Entry, EntryPatch, NewEntry};
use crate::metadata::schema::{CREATE_BLOBS_TABLE, CREATE_FILES_TABLE};
use crate::metadata::transaction::{TransactionEventHook, TransactionManager, TxOptions};
use crate::sql::stmt_cache::{Finalizable, StatementCache};
use crate::sql::SqlConn;
use crate::types::{now_ms, EntryKind, Tier};
use std::sync::Arc;

/// Named hot-path statement handle tracked through C3. Holds no resources
/// of its own: the real compiled statement lives in rusqlite's per-
/// connection `prepare_cached` cache, so there is nothing to release on
/// eviction.
struct StmtHandle;
impl Finalizable for StmtHandle {}

const HOT_STATEMENTS: &[&str] = &[
    "getByPath", "getById", "getChildren", "insertFile", "deleteFile", "getBlob", "insertBlob",
    "deleteBlob", "getBlobRefCount", "incrementBlobRef", "decrementBlobRef", "countBlobRefs",
    "updateBlobRefCount", "updateBlobTier", "countFiles", "countDirs", "sumSize", "tierStats",
];

pub struct MetadataStore {
    conn: Arc<SqlConn>,
    tx: TransactionManager,
    stmt_cache: StatementCache<StmtHandle>,
}

fn validate_path(path: &str) -> Result<()> {
    if path.split('/').any(|seg| seg == "..") {
        return Err(EngineError::InvalidArgument(format!("path must not contain '..': {path}")));
    }
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get("id")?,
        path: row.get("path")?,
        name: row.get("name")?,
        parent_id: row.get("parent_id")?,
        kind: row.get("type")?,
        mode: row.get::<_, i64>("mode")? as u32,
        uid: row.get::<_, i64>("uid")? as u32,
        gid: row.get::<_, i64>("gid")? as u32,
        size: row.get::<_, i64>("size")? as u64,
        blob_id: row.get("blob_id")?,
        link_target: row.get("link_target")?,
        tier: row.get("tier")?,
        atime: row.get("atime")?,
        mtime: row.get("mtime")?,
        ctime: row.get("ctime")?,
        birthtime: row.get("birthtime")?,
        nlink: row.get::<_, i64>("nlink")? as u32,
    })
}

fn row_to_blob(row: &rusqlite::Row) -> rusqlite::Result<Blob> {
    let page_keys_json: Option<String> = row.get("page_keys")?;
    Ok(Blob {
        id: row.get("id")?,
        tier: row.get("tier")?,
        size: row.get::<_, i64>("size")? as u64,
        checksum: row.get("checksum")?,
        created_at: row.get("created_at")?,
        ref_count: row.get("ref_count")?,
        is_chunked: row.get::<_, i64>("is_chunked")? != 0,
        page_keys: page_keys_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl MetadataStore {
    #[must_use]
    pub fn new(conn: Arc<SqlConn>, tx_config: &TransactionConfig) -> Self {
        let tx = TransactionManager::new(conn.clone(), tx_config.max_log_entries);
        let stmt_cache = StatementCache::new(HOT_STATEMENTS.len());
        Self { conn, tx, stmt_cache }
    }

    fn touch_stmt(&self, name: &'static str) {
        let _ = self.stmt_cache.get_or_insert_with::<std::convert::Infallible>(name, || Ok(StmtHandle));
    }

    /// Creates `files`/`blobs` tables and indexes, then inserts the root
    /// `files` row (id=0) if absent.
    ///
    /// # Errors
    /// Returns an error if any DDL/DML statement fails.
    pub fn init(&self) -> Result<()> {
        self.conn.with(|c| c.execute_batch(CREATE_FILES_TABLE))?;
        self.conn.with(|c| c.execute_batch(CREATE_BLOBS_TABLE))?;
        let now = now_ms();
        let root_mode: u32 = 0o755;
        self.conn.with(|c| {
            c.execute(
                "INSERT OR IGNORE INTO files(id, path, name, parent_id, type, mode, uid, gid, size, tier, atime, mtime, ctime, birthtime, nlink)
                 VALUES (0, '/', '/', NULL, 'directory', ?1, 0, 0, 0, 'hot', ?2, ?2, ?2, ?2, 1)",
                rusqlite::params![root_mode, now],
            )
        })?;
        Ok(())
    }

    pub fn set_transaction_event_hook(&self, hook: TransactionEventHook) {
        self.tx.set_event_hook(hook);
    }

    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.tx.is_in_transaction()
    }

    #[must_use]
    pub fn transaction_depth(&self) -> u32 {
        self.tx.transaction_depth()
    }

    pub fn recover_transactions(&self) {
        self.tx.recover();
    }

    #[must_use]
    pub fn transaction_log(&self) -> Vec<crate::types::TransactionLogRecord> {
        self.tx.log_snapshot()
    }

    /// Runs `f` under a (possibly nested) transaction with retry/timeout
    /// semantics.
    ///
    /// # Errors
    /// Propagates `f`'s error once retries are exhausted, or a timeout.
    pub fn transaction<T>(&self, opts: &TxOptions, f: impl FnMut() -> Result<T>) -> Result<T> {
        self.tx.transaction(opts, f)
    }

    fn default_tx_opts(&self) -> TxOptions {
        TxOptions::default()
    }

    // ---- Entries ----

    /// # Errors
    /// Propagates SQL errors.
    pub fn get_by_path(&self, path: &str) -> Result<Option<Entry>> {
        self.touch_stmt("getByPath");
        let entry = self
            .conn
            .with(|c| {
                let mut stmt = c.prepare_cached("SELECT * FROM files WHERE path = ?1")?;
                stmt.query_row([path], row_to_entry)
            })
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })?;
        Ok(entry)
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn get_by_id(&self, id: i64) -> Result<Option<Entry>> {
        self.touch_stmt("getById");
        let entry = self
            .conn
            .with(|c| {
                let mut stmt = c.prepare_cached("SELECT * FROM files WHERE id = ?1")?;
                stmt.query_row([id], row_to_entry)
            })
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })?;
        Ok(entry)
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn get_children(&self, parent_id: i64) -> Result<Vec<Entry>> {
        self.touch_stmt("getChildren");
        let entries = self.conn.with(|c| {
            let mut stmt = c.prepare_cached("SELECT * FROM files WHERE parent_id = ?1 ORDER BY name")?;
            let rows = stmt.query_map([parent_id], row_to_entry)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(entries)
    }

    /// Inserts a new entry, autoincrement id. Fails with `AlreadyExists` if
    /// `path` collides with an existing row.
    ///
    /// # Errors
    /// Returns `EngineError::AlreadyExists` on a path collision, otherwise
    /// propagates SQL errors.
    pub fn create_entry(&self, fields: NewEntry) -> Result<i64> {
        validate_path(&fields.path)?;
        self.touch_stmt("insertFile");
        let now = now_ms();
        let kind = fields.kind.unwrap_or(EntryKind::File);
        let tier = fields.tier.unwrap_or(Tier::Hot);
        let result = self.conn.with(|c| {
            c.execute(
                "INSERT INTO files(path, name, parent_id, type, mode, uid, gid, size, blob_id, link_target, tier, atime, mtime, ctime, birthtime, nlink)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?12, ?12, 1)",
                rusqlite::params![
                    fields.path,
                    fields.name,
                    fields.parent_id,
                    kind,
                    fields.mode.unwrap_or(0),
                    fields.uid.unwrap_or(0),
                    fields.gid.unwrap_or(0),
                    fields.size.unwrap_or(0) as i64,
                    fields.blob_id,
                    fields.link_target,
                    tier,
                    now,
                ],
            )
        });
        self.tx.record_operation();
        match result {
            Ok(_) => self.conn.with(|c| Ok(c.last_insert_rowid())).map_err(EngineError::from),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                Err(EngineError::AlreadyExists(fields.path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Applies a partial update, always advancing `ctime`.
    ///
    /// # Errors
    /// Propagates SQL errors, including a path collision.
    pub fn update_entry(&self, id: i64, patch: EntryPatch) -> Result<()> {
        if let Some(path) = &patch.path {
            validate_path(path)?;
        }
        let now = now_ms();
        self.conn.with(|c| {
            c.execute(
                "UPDATE files SET
                    path = COALESCE(?1, path),
                    parent_id = COALESCE(?2, parent_id),
                    size = COALESCE(?3, size),
                    tier = COALESCE(?4, tier),
                    mode = COALESCE(?5, mode),
                    uid = COALESCE(?6, uid),
                    gid = COALESCE(?7, gid),
                    atime = COALESCE(?8, atime),
                    mtime = COALESCE(?9, mtime),
                    ctime = ?10
                 WHERE id = ?11",
                rusqlite::params![
                    patch.path,
                    patch.parent_id,
                    patch.size.map(|v| v as i64),
                    patch.tier,
                    patch.mode,
                    patch.uid,
                    patch.gid,
                    patch.atime,
                    patch.mtime,
                    now,
                    id,
                ],
            )
        })?;
        // blob_id is a tri-state field (leave / clear / set), handled
        // separately since a single COALESCE can't distinguish "unset" from
        // "explicitly cleared to NULL".
        if let Some(blob_id) = &patch.blob_id {
            self.conn.with(|c| c.execute("UPDATE files SET blob_id = ?1 WHERE id = ?2", rusqlite::params![blob_id, id]))?;
        }
        self.tx.record_operation();
        Ok(())
    }

    /// Deletes the entry; descendants cascade via the foreign key.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn delete_entry(&self, id: i64) -> Result<()> {
        self.touch_stmt("deleteFile");
        self.conn.with(|c| c.execute("DELETE FROM files WHERE id = ?1", [id]))?;
        self.tx.record_operation();
        Ok(())
    }

    /// Maps `*`→`%` and `?`→`_` and runs a `LIKE` scan, optionally prefixed
    /// by `parent_path%`.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn find_by_pattern(&self, glob: &str, parent_path: Option<&str>) -> Result<Vec<Entry>> {
        let like_pattern = glob.replace('*', "%").replace('?', "_");
        let full_pattern = match parent_path {
            Some(p) => format!("{p}%{like_pattern}"),
            None => like_pattern,
        };
        let entries = self.conn.with(|c| {
            let mut stmt = c.prepare_cached("SELECT * FROM files WHERE path LIKE ?1")?;
            let rows = stmt.query_map([&full_pattern], row_to_entry)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(entries)
    }

    /// All-or-nothing insert of multiple entries.
    ///
    /// # Errors
    /// Returns the first failure; no row is written on any failure.
    pub fn create_entries_atomic(&self, entries: Vec<NewEntry>) -> Result<Vec<i64>> {
        self.transaction(&self.default_tx_opts(), || {
            entries.iter().map(|e| self.create_entry(e.clone())).collect()
        })
    }

    /// # Errors
    /// Returns the first failure; no row is deleted on any failure.
    pub fn delete_entries_atomic(&self, ids: &[i64]) -> Result<()> {
        self.transaction(&self.default_tx_opts(), || {
            for id in ids {
                self.delete_entry(*id)?;
            }
            Ok(())
        })
    }

    // ---- Blobs ----

    /// # Errors
    /// Propagates SQL errors.
    pub fn register_blob(&self, blob: NewBlob) -> Result<()> {
        self.touch_stmt("insertBlob");
        let page_keys_json = blob.page_keys.as_ref().map(|k| serde_json::to_string(k)).transpose()?;
        self.conn.with(|c| {
            c.execute(
                "INSERT INTO blobs(id, tier, size, checksum, created_at, ref_count, is_chunked, page_keys)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET ref_count = ref_count + 1",
                rusqlite::params![
                    blob.id,
                    blob.tier,
                    blob.size as i64,
                    blob.checksum,
                    now_ms(),
                    i32::from(blob.is_chunked),
                    page_keys_json,
                ],
            )
        })?;
        self.tx.record_operation();
        Ok(())
    }

    /// # Errors
    /// Returns the first failure; no row is written on any failure.
    pub fn register_blobs_atomic(&self, blobs: Vec<NewBlob>) -> Result<()> {
        self.transaction(&self.default_tx_opts(), || {
            for blob in &blobs {
                self.register_blob(blob.clone())?;
            }
            Ok(())
        })
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn get_blob(&self, id: &str) -> Result<Option<Blob>> {
        self.touch_stmt("getBlob");
        let blob = self
            .conn
            .with(|c| {
                let mut stmt = c.prepare_cached("SELECT * FROM blobs WHERE id = ?1")?;
                stmt.query_row([id], row_to_blob)
            })
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })?;
        Ok(blob)
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn update_blob_tier(&self, id: &str, tier: Tier) -> Result<()> {
        self.touch_stmt("updateBlobTier");
        self.conn.with(|c| c.execute("UPDATE blobs SET tier = ?1 WHERE id = ?2", rusqlite::params![tier, id]))?;
        self.tx.record_operation();
        Ok(())
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn delete_blob(&self, id: &str) -> Result<()> {
        self.touch_stmt("deleteBlob");
        self.conn.with(|c| c.execute("DELETE FROM blobs WHERE id = ?1", [id]))?;
        self.tx.record_operation();
        Ok(())
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn get_blob_ref_count(&self, id: &str) -> Result<i64> {
        self.touch_stmt("getBlobRefCount");
        let count: i64 = self.conn.with(|c| {
            c.query_row("SELECT ref_count FROM blobs WHERE id = ?1", [id], |r| r.get(0))
        })?;
        Ok(count)
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn increment_blob_ref_count(&self, id: &str) -> Result<i64> {
        self.touch_stmt("incrementBlobRef");
        self.conn.with(|c| c.execute("UPDATE blobs SET ref_count = ref_count + 1 WHERE id = ?1", [id]))?;
        self.tx.record_operation();
        self.get_blob_ref_count(id)
    }

    /// Decrements the ref count, returning whether it has reached zero (in
    /// which case the router is expected to delete page storage/object-store
    /// data and the caller should follow up with `delete_blob`).
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn decrement_blob_ref_count(&self, id: &str) -> Result<bool> {
        self.touch_stmt("decrementBlobRef");
        self.conn.with(|c| {
            c.execute("UPDATE blobs SET ref_count = MAX(ref_count - 1, 0) WHERE id = ?1", [id])
        })?;
        self.tx.record_operation();
        Ok(self.get_blob_ref_count(id)? == 0)
    }

    /// Live `COUNT(*)` of files referencing `id`, independent of the cached
    /// `ref_count` column.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn count_blob_references(&self, id: &str) -> Result<i64> {
        self.touch_stmt("countBlobRefs");
        let count: i64 =
            self.conn.with(|c| c.query_row("SELECT COUNT(*) FROM files WHERE blob_id = ?1", [id], |r| r.get(0)))?;
        Ok(count)
    }

    /// Writes the live reference count back to the cached `ref_count`
    /// column.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn sync_blob_ref_count(&self, id: &str) -> Result<i64> {
        let live = self.count_blob_references(id)?;
        self.touch_stmt("updateBlobRefCount");
        self.conn.with(|c| c.execute("UPDATE blobs SET ref_count = ?1 WHERE id = ?2", rusqlite::params![live, id]))?;
        self.tx.record_operation();
        Ok(live)
    }

    // ---- Introspection (backs the prepared-statement usage list and the
    // tiered router's migration scan) ----

    /// # Errors
    /// Propagates SQL errors.
    pub fn count_files(&self) -> Result<i64> {
        self.touch_stmt("countFiles");
        Ok(self.conn.with(|c| c.query_row("SELECT COUNT(*) FROM files WHERE type = 'file'", [], |r| r.get(0)))?)
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn count_dirs(&self) -> Result<i64> {
        self.touch_stmt("countDirs");
        Ok(self.conn.with(|c| c.query_row("SELECT COUNT(*) FROM files WHERE type = 'directory'", [], |r| r.get(0)))?)
    }

    /// # Errors
    /// Propagates SQL errors.
    pub fn sum_size(&self) -> Result<i64> {
        self.touch_stmt("sumSize");
        Ok(self.conn.with(|c| c.query_row("SELECT COALESCE(SUM(size), 0) FROM files", [], |r| r.get(0)))?)
    }

    /// Per-tier `{count, total_size}` for every blob tier.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn tier_stats(&self) -> Result<Vec<(Tier, i64, i64)>> {
        self.touch_stmt("tierStats");
        let rows = self.conn.with(|c| {
            let mut stmt = c.prepare_cached("SELECT tier, COUNT(*), COALESCE(SUM(size), 0) FROM blobs GROUP BY tier")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, Tier>(0)?, r.get(1)?, r.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows)
    }

    #[must_use]
    pub fn stmt_cache_stats(&self) -> crate::sql::stmt_cache::StmtCacheStats {
        self.stmt_cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetadataStore {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        let store = MetadataStore::new(conn, &TransactionConfig::default());
        store.init().unwrap();
        store
    }

    #[test]
    fn init_creates_root_entry() {
        let store = store();
        let root = store.get_by_path("/").unwrap().unwrap();
        assert_eq!(root.id, 0);
        assert_eq!(root.kind, EntryKind::Directory);
    }

    #[test]
    fn create_entry_rejects_duplicate_path() {
        let store = store();
        let new_entry = |path: &str| NewEntry { path: path.to_string(), name: "a".to_string(), parent_id: Some(0), ..Default::default() };
        store.create_entry(new_entry("/a")).unwrap();
        let err = store.create_entry(new_entry("/a")).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn create_entry_rejects_dotdot_path() {
        let store = store();
        let entry = NewEntry { path: "/a/../b".to_string(), name: "b".to_string(), parent_id: Some(0), ..Default::default() };
        let err = store.create_entry(entry).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn update_entry_advances_ctime() {
        let store = store();
        let id = store
            .create_entry(NewEntry { path: "/a".to_string(), name: "a".to_string(), parent_id: Some(0), ..Default::default() })
            .unwrap();
        let before = store.get_by_id(id).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.update_entry(id, EntryPatch { size: Some(42), ..Default::default() }).unwrap();
        let after = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(after.size, 42);
        assert!(after.ctime >= before.ctime);
    }

    #[test]
    fn delete_cascades_to_children() {
        let store = store();
        let parent = store
            .create_entry(NewEntry { path: "/d".to_string(), name: "d".to_string(), parent_id: Some(0), kind: Some(EntryKind::Directory), ..Default::default() })
            .unwrap();
        store
            .create_entry(NewEntry { path: "/d/child".to_string(), name: "child".to_string(), parent_id: Some(parent), ..Default::default() })
            .unwrap();
        store.delete_entry(parent).unwrap();
        assert!(store.get_by_path("/d/child").unwrap().is_none());
    }

    #[test]
    fn find_by_pattern_translates_glob_to_like() {
        let store = store();
        store.create_entry(NewEntry { path: "/foo.txt".to_string(), name: "foo.txt".to_string(), parent_id: Some(0), ..Default::default() }).unwrap();
        store.create_entry(NewEntry { path: "/bar.txt".to_string(), name: "bar.txt".to_string(), parent_id: Some(0), ..Default::default() }).unwrap();
        let matches = store.find_by_pattern("*.txt", None).unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn create_entries_atomic_rolls_back_on_failure() {
        let store = store();
        let good = NewEntry { path: "/x".to_string(), name: "x".to_string(), parent_id: Some(0), ..Default::default() };
        let dup = NewEntry { path: "/x".to_string(), name: "x".to_string(), parent_id: Some(0), ..Default::default() };
        let err = store.create_entries_atomic(vec![good, dup]).unwrap_err();
        assert!(!err.to_string().is_empty());
        assert!(store.get_by_path("/x").unwrap().is_none());
    }

    #[test]
    fn blob_ref_counting_lifecycle() {
        let store = store();
        store
            .register_blob(NewBlob { id: "b1".to_string(), tier: Tier::Hot, size: 10, checksum: None, is_chunked: false, page_keys: None })
            .unwrap();
        assert_eq!(store.get_blob_ref_count("b1").unwrap(), 1);
        store.increment_blob_ref_count("b1").unwrap();
        assert_eq!(store.get_blob_ref_count("b1").unwrap(), 2);
        assert!(!store.decrement_blob_ref_count("b1").unwrap());
        assert!(store.decrement_blob_ref_count("b1").unwrap());
    }

    #[test]
    fn count_blob_references_reflects_live_files() {
        let store = store();
        store
            .register_blob(NewBlob { id: "b1".to_string(), tier: Tier::Hot, size: 10, checksum: None, is_chunked: false, page_keys: None })
            .unwrap();
        store
            .create_entry(NewEntry { path: "/f".to_string(), name: "f".to_string(), parent_id: Some(0), blob_id: Some("b1".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(store.count_blob_references("b1").unwrap(), 1);
        assert_eq!(store.sync_blob_ref_count("b1").unwrap(), 1);
    }
}
