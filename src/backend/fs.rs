use crate::backend::{BlobBackend, GetResult, HeadResult, ListOptions, ListResult, ListedObject, PutResult};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Maps object keys to files under a root directory. The one place in the
/// backend layer that touches `std::fs` directly.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// # Errors
    /// Returns an error if `root` cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|seg| seg == "..") {
            return Err(EngineError::InvalidArgument(format!("invalid backend key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[async_trait]
impl BlobBackend for FsBackend {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutResult> {
        let path = self.path_for(key)?;
        ensure_parent(&path)?;
        std::fs::write(&path, bytes)?;
        Ok(PutResult { etag: None, version_id: None, size: bytes.len() as u64 })
    }

    async fn get(&self, key: &str) -> Result<Option<GetResult>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(GetResult { data, metadata: None })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<HeadResult>> {
        let path = self.path_for(key)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(HeadResult { size: meta.len(), metadata: None })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult> {
        let prefix = opts.prefix.unwrap_or_default();
        let mut objects = Vec::new();
        collect_files(&self.root, &self.root, &prefix, &mut objects)?;
        objects.sort_by(|a: &ListedObject, b| a.key.cmp(&b.key));
        let truncated = opts.limit.is_some_and(|limit| objects.len() > limit);
        if let Some(limit) = opts.limit {
            objects.truncate(limit);
        }
        Ok(ListResult { objects, truncated })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let start = start.min(len);
        let end = end.min(len).max(start);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }
}

fn collect_files(root: &Path, dir: &Path, prefix: &str, out: &mut Vec<ListedObject>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, prefix, out)?;
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(&path);
        let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
        if key.starts_with(prefix) {
            let size = entry.metadata()?.len();
            out.push(ListedObject { key, size });
        }
    }
    Ok(())
}
