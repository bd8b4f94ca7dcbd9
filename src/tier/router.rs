//! Hot/warm/cold backend selection with access-driven promotion and
//! demotion (C7).

use crate::backend::{BlobBackend, GetResult, HeadResult, ListOptions, ListResult, PutResult};
use crate::errors::Result;
use crate::metadata::MetadataStore;
use crate::sql::SqlConn;
use crate::tier::policy::TierPolicy;
use crate::types::{Tier, now_ms};
use std::sync::Arc;

const CREATE_BLOB_ACCESS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS blob_access (
    key TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    last_access_ms INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);
";

#[derive(Debug, Clone)]
pub struct GetOutcome {
    pub data: Vec<u8>,
    pub tier: Tier,
    pub migrated: bool,
    pub previous_tier: Option<Tier>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub promoted: Vec<String>,
    pub demoted: Vec<String>,
    pub errors: Vec<String>,
}

/// Routes blob operations across hot/warm/cold backends, tracking per-key
/// access recency/frequency in `blob_access` so [`Self::run_migration`]
/// survives a process restart.
pub struct BlobRouter {
    conn: Arc<SqlConn>,
    hot: Arc<dyn BlobBackend>,
    warm: Arc<dyn BlobBackend>,
    cold: Arc<dyn BlobBackend>,
    metadata: Arc<MetadataStore>,
    policy: TierPolicy,
}

impl BlobRouter {
    #[must_use]
    pub fn new(
        conn: Arc<SqlConn>,
        hot: Arc<dyn BlobBackend>,
        warm: Arc<dyn BlobBackend>,
        cold: Arc<dyn BlobBackend>,
        metadata: Arc<MetadataStore>,
        policy: TierPolicy,
    ) -> Self {
        Self { conn, hot, warm, cold, metadata, policy }
    }

    /// # Errors
    /// Returns an error if the `blob_access` table cannot be created.
    pub fn init(&self) -> Result<()> {
        self.conn.with(|c| c.execute_batch(CREATE_BLOB_ACCESS_TABLE))?;
        Ok(())
    }

    fn backend_for(&self, tier: Tier) -> &Arc<dyn BlobBackend> {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    fn current_tier(&self, key: &str) -> Result<Tier> {
        let row: Option<String> =
            self.conn.with(|c| c.query_row("SELECT tier FROM blob_access WHERE key = ?1", [key], |r| r.get(0))).ok();
        Ok(row.and_then(|s| Tier::from_str(&s)).unwrap_or(Tier::Hot))
    }

    fn record_access(&self, key: &str, tier: Tier) -> Result<()> {
        self.conn.with(|c| {
            c.execute(
                "INSERT INTO blob_access (key, tier, last_access_ms, access_count) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(key) DO UPDATE SET tier = excluded.tier, last_access_ms = excluded.last_access_ms, access_count = access_count + 1",
                rusqlite::params![key, tier.as_str(), now_ms()],
            )
        })?;
        Ok(())
    }

    fn set_tier_only(&self, key: &str, tier: Tier) -> Result<()> {
        self.conn.with(|c| {
            c.execute(
                "INSERT INTO blob_access (key, tier, last_access_ms, access_count) VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(key) DO UPDATE SET tier = excluded.tier",
                rusqlite::params![key, tier.as_str(), now_ms()],
            )
        })?;
        Ok(())
    }

    /// # Errors
    /// Propagates backend failures.
    pub async fn put(&self, key: &str, bytes: &[u8], tier: Tier) -> Result<PutResult> {
        let result = self.backend_for(tier).put(key, bytes).await?;
        self.record_access(key, tier)?;
        if self.metadata.get_blob(key)?.is_some() {
            self.metadata.update_blob_tier(key, tier)?;
        }
        Ok(result)
    }

    /// Checks hot → warm → cold in order; on hit with `autoPromote` enabled,
    /// moves the object up one tier and reports `migrated: true`.
    ///
    /// # Errors
    /// Propagates backend or metadata failures.
    pub async fn get(&self, key: &str) -> Result<Option<GetOutcome>> {
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            let Some(GetResult { data, .. }) = self.backend_for(tier).get(key).await? else { continue };
            self.record_access(key, tier)?;
            if self.policy.auto_promote
                && let Some(target) = TierPolicy::promotion_target(tier)
            {
                self.migrate_key(key, tier, target).await?;
                return Ok(Some(GetOutcome { data, tier: target, migrated: true, previous_tier: Some(tier) }));
            }
            return Ok(Some(GetOutcome { data, tier, migrated: false, previous_tier: None }));
        }
        Ok(None)
    }

    /// # Errors
    /// Propagates backend failures.
    pub async fn head(&self, key: &str) -> Result<Option<HeadResult>> {
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            if let Some(head) = self.backend_for(tier).head(key).await? {
                return Ok(Some(head));
            }
        }
        Ok(None)
    }

    /// # Errors
    /// Propagates backend failures.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// # Errors
    /// Propagates backend failures.
    pub async fn delete(&self, key: &str) -> Result<()> {
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            self.backend_for(tier).delete(key).await?;
        }
        self.conn.with(|c| c.execute("DELETE FROM blob_access WHERE key = ?1", [key]))?;
        Ok(())
    }

    /// # Errors
    /// Propagates the first backend failure.
    pub async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Copies `src` to `dst`, in `tier` if given, else the tier `src`
    /// currently resides in.
    ///
    /// # Errors
    /// Returns `NotFound` if `src` is absent from every tier.
    pub async fn copy(&self, src: &str, dst: &str, tier: Option<Tier>) -> Result<()> {
        let current = self.current_tier(src)?;
        let data = self
            .get_raw(src, current)
            .await?
            .ok_or_else(|| crate::errors::EngineError::NotFound(src.to_string()))?;
        let target = tier.unwrap_or(current);
        self.backend_for(target).put(dst, &data).await?;
        self.record_access(dst, target)?;
        Ok(())
    }

    async fn get_raw(&self, key: &str, tier: Tier) -> Result<Option<Vec<u8>>> {
        Ok(self.backend_for(tier).get(key).await?.map(|g| g.data))
    }

    /// Moves `key`'s bytes into `tier`, updating the metadata row's tier and
    /// migrating every chunk blob first if `key` is chunked.
    ///
    /// # Errors
    /// Returns `NotFound` if `key` is absent from its current tier.
    pub async fn promote(&self, key: &str, tier: Tier) -> Result<()> {
        let current = self.current_tier(key)?;
        self.migrate_key(key, current, tier).await
    }

    /// Same as [`Self::promote`] but for moving down the tier hierarchy; the
    /// direction is implied purely by which tiers are passed.
    ///
    /// # Errors
    /// Returns `NotFound` if `key` is absent from its current tier.
    pub async fn demote(&self, key: &str, tier: Tier) -> Result<()> {
        let current = self.current_tier(key)?;
        self.migrate_key(key, current, tier).await
    }

    async fn migrate_key(&self, key: &str, from: Tier, to: Tier) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if let Some(blob) = self.metadata.get_blob(key)?
            && blob.is_chunked
            && let Some(chunk_keys) = &blob.page_keys
        {
            for chunk_key in chunk_keys {
                Box::pin(self.migrate_key(chunk_key, from, to)).await?;
            }
        }
        let data = self
            .get_raw(key, from)
            .await?
            .ok_or_else(|| crate::errors::EngineError::NotFound(key.to_string()))?;
        self.backend_for(to).put(key, &data).await?;
        self.backend_for(from).delete(key).await?;
        self.set_tier_only(key, to)?;
        if self.metadata.get_blob(key)?.is_some() {
            self.metadata.update_blob_tier(key, to)?;
        }
        log::info!("tier migration: key={key} from={} to={}", from.as_str(), to.as_str());
        Ok(())
    }

    /// # Errors
    /// Propagates backend failures.
    pub async fn list_by_tier(&self, tier: Tier, opts: ListOptions) -> Result<ListResult> {
        self.backend_for(tier).list(opts).await
    }

    /// # Errors
    /// Propagates backend failures.
    pub async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Option<Vec<u8>>> {
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            if let Some(data) = self.backend_for(tier).get_range(key, start, end).await? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Walks per-tier access-time metadata and moves keys whose last access
    /// exceeds the configured thresholds down a tier, and recently-accessed
    /// cold keys up a tier, bounded by `maxPromotionsPerRun`.
    ///
    /// # Errors
    /// Never returns an error directly; per-key migration failures are
    /// collected into `MigrationReport::errors` instead, so one bad key does
    /// not abort the run.
    pub async fn run_migration(&self, dry_run: bool) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let now = now_ms();
        let day_ms: i64 = 86_400_000;

        if self.policy.auto_demote {
            for tier in [Tier::Hot, Tier::Warm] {
                let Some(max_age) = self.policy.max_age_days(tier) else { continue };
                let cutoff = now - i64::from(max_age) * day_ms;
                let keys: Vec<String> = self
                    .conn
                    .with(|c| {
                        let mut stmt = c.prepare("SELECT key FROM blob_access WHERE tier = ?1 AND last_access_ms < ?2")?;
                        let rows = stmt.query_map(rusqlite::params![tier.as_str(), cutoff], |r| r.get::<_, String>(0))?;
                        rows.collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .unwrap_or_default();
                let Some(target) = TierPolicy::demotion_target(tier) else { continue };
                for key in keys {
                    if report.demoted.len() >= self.policy.max_promotions_per_run {
                        break;
                    }
                    if dry_run {
                        report.demoted.push(key);
                        continue;
                    }
                    match self.migrate_key(&key, tier, target).await {
                        Ok(()) => report.demoted.push(key),
                        Err(e) => report.errors.push(format!("{key}: {e}")),
                    }
                }
            }
        }

        if self.policy.auto_promote {
            let keys: Vec<String> = self
                .conn
                .with(|c| {
                    let mut stmt = c.prepare("SELECT key FROM blob_access WHERE tier = 'cold' AND access_count >= ?1")?;
                    let rows = stmt.query_map([self.policy.min_access_count_to_promote], |r| r.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                })
                .unwrap_or_default();
            for key in keys {
                if report.promoted.len() >= self.policy.max_promotions_per_run {
                    break;
                }
                if dry_run {
                    report.promoted.push(key);
                    continue;
                }
                match self.migrate_key(&key, Tier::Cold, Tier::Warm).await {
                    Ok(()) => report.promoted.push(key),
                    Err(e) => report.errors.push(format!("{key}: {e}")),
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::metadata::NewBlob;

    fn router() -> BlobRouter {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        let metadata = Arc::new(MetadataStore::new(conn.clone(), &crate::config::TransactionConfig::default()));
        metadata.init().unwrap();
        let router = BlobRouter::new(
            conn,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            metadata,
            TierPolicy { hot_max_age_days: 0, warm_max_age_days: 0, ..TierPolicy::default() },
        );
        router.init().unwrap();
        router
    }

    #[tokio::test]
    async fn get_auto_promotes_from_warm_to_hot() {
        let router = router();
        router.put("k1", b"hello", Tier::Warm).await.unwrap();
        let outcome = router.get("k1").await.unwrap().unwrap();
        assert_eq!(outcome.data, b"hello");
        assert!(outcome.migrated);
        assert_eq!(outcome.tier, Tier::Hot);
        assert!(router.hot.get("k1").await.unwrap().is_some());
        assert!(router.warm.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promote_moves_chunked_blob_chunks() {
        let router = router();
        router.warm.put("c1", b"a").await.unwrap();
        router.warm.put("c2", b"b").await.unwrap();
        router.warm.put("parent", b"").await.unwrap();
        router.set_tier_only("c1", Tier::Warm).unwrap();
        router.set_tier_only("c2", Tier::Warm).unwrap();
        router.set_tier_only("parent", Tier::Warm).unwrap();
        router
            .metadata
            .register_blob(NewBlob {
                id: "parent".to_string(),
                tier: Tier::Warm,
                size: 0,
                checksum: None,
                is_chunked: true,
                page_keys: Some(vec!["c1".to_string(), "c2".to_string()]),
            })
            .unwrap();
        router.promote("parent", Tier::Hot).await.unwrap();
        assert!(router.hot.get("c1").await.unwrap().is_some());
        assert!(router.hot.get("c2").await.unwrap().is_some());
        assert!(router.hot.get("parent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_migration_demotes_stale_hot_keys() {
        let router = router();
        router.put("stale", b"x", Tier::Hot).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let report = router.run_migration(false).await.unwrap();
        assert!(report.demoted.contains(&"stale".to_string()));
        assert!(router.warm.get("stale").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_migration_dry_run_does_not_move_data() {
        let router = router();
        router.put("stale", b"x", Tier::Hot).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let report = router.run_migration(true).await.unwrap();
        assert!(report.demoted.contains(&"stale".to_string()));
        assert!(router.hot.get("stale").await.unwrap().is_some());
    }
}
