//! Blob backend (C8): a narrow `put/get/head/delete/list` interface to an
//! external object store. No logic of its own — the engine's only
//! expectations of a backend are the ones spelled out on [`BlobBackend`].

mod fs;
mod memory;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

use crate::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PutResult {
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub data: Vec<u8>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct HeadResult {
    pub size: u64,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ListedObject>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

/// The object-store collaborator interface. Not assumed to provide atomic
/// multi-key operations; `delete_many` may be implemented as a loop over
/// `delete`.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutResult>;
    async fn get(&self, key: &str) -> Result<Option<GetResult>>;
    async fn head(&self, key: &str) -> Result<Option<HeadResult>>;
    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult>;

    /// Optional: returns `Ok(None)` by default when range reads are
    /// unsupported by a given backend.
    async fn get_range(&self, _key: &str, _start: u64, _end: u64) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
