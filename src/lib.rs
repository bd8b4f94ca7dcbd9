#![forbid(unsafe_code)]

pub mod backend;
pub mod buffer;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod errors;
pub mod extent;
pub mod metadata;
pub mod sql;
pub mod tier;
pub mod types;
pub mod utils;

pub use utils::feature_flags;
pub use utils::logger;

use crate::backend::{BlobBackend, FsBackend, MemoryBackend};
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::extent::ExtentEngine;
use crate::metadata::MetadataStore;
use crate::sql::SqlConn;
use crate::tier::{BlobRouter, TierPolicy};
use std::path::Path;
use std::sync::Arc;

/// Bundles the metadata store (C5), extent engine (C4) and tiered blob
/// router (C7) behind one handle opened from a single SQLite file and a
/// data directory, the same role the teacher's top-level database struct
/// plays over its own storage engine.
pub struct Engine {
    pub metadata: Arc<MetadataStore>,
    pub extents: Arc<ExtentEngine>,
    pub router: Arc<BlobRouter>,
    config: EngineConfig,
}

impl Engine {
    /// Opens (or creates) the engine's SQLite database at `db_path`, rooting
    /// the extent engine and the warm/cold tier backends under `data_dir`.
    /// The hot tier is in-memory. Initializes logging under `data_dir` when
    /// the `engine-logging` feature flag is enabled.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened, any backend
    /// directory cannot be created, or schema initialization fails.
    pub fn open(db_path: &Path, data_dir: &Path, config: EngineConfig) -> Result<Self> {
        if crate::feature_flags::is_enabled("engine-logging") {
            let _ = logger::init_for_engine_in(data_dir, "fsx");
        }

        let conn = Arc::new(SqlConn::open(db_path)?);
        let metadata = Arc::new(MetadataStore::new(conn.clone(), &config.transaction));
        metadata.init()?;

        let extent_backend: Arc<dyn BlobBackend> = Arc::new(FsBackend::new(data_dir.join("extents"))?);
        let extents = Arc::new(ExtentEngine::new(conn.clone(), extent_backend, config.extent.clone()));
        extents.init()?;

        let hot: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let warm: Arc<dyn BlobBackend> = Arc::new(FsBackend::new(data_dir.join("warm"))?);
        let cold: Arc<dyn BlobBackend> = Arc::new(FsBackend::new(data_dir.join("cold"))?);
        let router = Arc::new(BlobRouter::new(
            conn,
            hot,
            warm,
            cold,
            metadata.clone(),
            TierPolicy::from(&config.tier_policy),
        ));
        router.init()?;

        Ok(Self { metadata, extents, router, config })
    }

    /// Opens a fully in-memory engine (SQLite `:memory:` plus in-memory blob
    /// backends for every tier), useful for tests and the `fsx-admin`
    /// dry-run paths that should not touch disk.
    ///
    /// # Errors
    /// Returns an error if schema initialization fails.
    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        let conn = Arc::new(SqlConn::open_in_memory()?);
        let metadata = Arc::new(MetadataStore::new(conn.clone(), &config.transaction));
        metadata.init()?;

        let extent_backend: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let extents = Arc::new(ExtentEngine::new(conn.clone(), extent_backend, config.extent.clone()));
        extents.init()?;

        let hot: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let warm: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let cold: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
        let router = Arc::new(BlobRouter::new(
            conn,
            hot,
            warm,
            cold,
            metadata.clone(),
            TierPolicy::from(&config.tier_policy),
        ));
        router.init()?;

        Ok(Self { metadata, extents, router, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
