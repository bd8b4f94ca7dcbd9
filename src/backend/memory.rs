use crate::backend::{BlobBackend, GetResult, HeadResult, ListOptions, ListResult, ListedObject, PutResult};
use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-process backend, used by tests and as the default when no remote
/// object store is configured.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutResult> {
        self.objects.write().insert(key.to_string(), bytes.to_vec());
        Ok(PutResult { etag: None, version_id: None, size: bytes.len() as u64 })
    }

    async fn get(&self, key: &str) -> Result<Option<GetResult>> {
        Ok(self.objects.read().get(key).map(|data| GetResult { data: data.clone(), metadata: None }))
    }

    async fn head(&self, key: &str) -> Result<Option<HeadResult>> {
        Ok(self.objects.read().get(key).map(|data| HeadResult { size: data.len() as u64, metadata: None }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult> {
        let objects = self.objects.read();
        let mut matches: Vec<ListedObject> = objects
            .iter()
            .filter(|(k, _)| opts.prefix.as_deref().is_none_or(|p| k.starts_with(p)))
            .map(|(k, v)| ListedObject { key: k.clone(), size: v.len() as u64 })
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        let truncated = opts.limit.is_some_and(|limit| matches.len() > limit);
        if let Some(limit) = opts.limit {
            matches.truncate(limit);
        }
        Ok(ListResult { objects: matches, truncated })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read();
        Ok(objects.get(key).map(|data| {
            let start = start as usize;
            let end = (end as usize).min(data.len());
            if start >= data.len() { Vec::new() } else { data[start..end].to_vec() }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put("a", b"hello").await.unwrap();
        let got = backend.get("a").await.unwrap().unwrap();
        assert_eq!(got.data, b"hello");
        backend.delete("a").await.unwrap();
        assert!(backend.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_respects_prefix_and_limit() {
        let backend = MemoryBackend::new();
        backend.put("extent/a", b"1").await.unwrap();
        backend.put("extent/b", b"22").await.unwrap();
        backend.put("other/c", b"333").await.unwrap();
        let res = backend
            .list(ListOptions { prefix: Some("extent/".to_string()), limit: Some(1) })
            .await
            .unwrap();
        assert_eq!(res.objects.len(), 1);
        assert!(res.truncated);
    }
}
