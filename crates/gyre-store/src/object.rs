use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Content-addressed-by-path blob store. Blobs are immutable: writing a path
/// twice is a conflict, which is what makes versioned attractor paths safe to
/// cache forever.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> StoreResult<()>;
    async fn get(&self, path: &str) -> StoreResult<Vec<u8>>;
    async fn exists(&self, path: &str) -> StoreResult<bool>;
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_object_path(path)?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("object store mutex poisoned".to_string()))?;
        if blobs.contains_key(path) {
            return Err(StoreError::Conflict(format!(
                "object '{path}' already exists"
            )));
        }
        blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("object store mutex poisoned".to_string()))?;
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "object",
                id: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("object store mutex poisoned".to_string()))?;
        Ok(blobs.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("object store mutex poisoned".to_string()))?;
        Ok(blobs
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Filesystem-backed store rooted at a directory; object paths map onto
/// relative file paths under the root.
#[derive(Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        validate_object_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        let target = self.resolve(path)?;
        if tokio::fs::try_exists(&target)
            .await
            .map_err(|error| backend(&target, error))?
        {
            return Err(StoreError::Conflict(format!(
                "object '{path}' already exists"
            )));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| backend(parent, error))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|error| backend(&target, error))
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound {
                    resource: "object",
                    id: path.to_string(),
                })
            }
            Err(error) => Err(backend(&target, error)),
        }
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|error| backend(&target, error))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(backend(&dir, error)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|error| backend(&dir, error))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        found.push(key);
                    }
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

fn validate_object_path(path: &str) -> StoreResult<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(StoreError::InvalidInput(format!(
            "object path '{path}' must be relative and non-empty"
        )));
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(StoreError::InvalidInput(format!(
            "object path '{path}' contains invalid segments"
        )));
    }
    Ok(())
}

fn backend(path: &Path, error: std::io::Error) -> StoreError {
    StoreError::Backend(format!("io failure at '{}': {error}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test(flavor = "current_thread")]
    async fn memory_store_put_get_expected_round_trip() {
        let store = MemoryObjectStore::new();
        store
            .put("attractors/global/self/v1.dot", b"digraph g {}")
            .await
            .expect("put should succeed");

        let bytes = store
            .get("attractors/global/self/v1.dot")
            .await
            .expect("get should succeed");
        assert_eq!(bytes, b"digraph g {}");
        assert!(
            store
                .exists("attractors/global/self/v1.dot")
                .await
                .expect("exists should succeed")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_store_rewrite_expected_conflict() {
        let store = MemoryObjectStore::new();
        store.put("a/b", b"one").await.expect("first put succeeds");
        let error = store.put("a/b", b"two").await.expect_err("second put fails");
        assert!(matches!(error, StoreError::Conflict(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_path_traversal_expected_rejection() {
        let store = MemoryObjectStore::new();
        let error = store.put("../escape", b"x").await.expect_err("must fail");
        assert!(matches!(error, StoreError::InvalidInput(_)));
        let error = store.put("/abs", b"x").await.expect_err("must fail");
        assert!(matches!(error, StoreError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_store_round_trip_and_list() {
        let temp = TempDir::new().expect("temp dir should create");
        let store = FsObjectStore::new(temp.path());

        store
            .put("runs/p/r/notes.md", b"hello")
            .await
            .expect("put should succeed");
        store
            .put("runs/p/r/reviewers/a.md", b"review")
            .await
            .expect("put should succeed");

        assert_eq!(
            store.get("runs/p/r/notes.md").await.expect("get succeeds"),
            b"hello"
        );
        let listed = store.list("runs/p/r/").await.expect("list succeeds");
        assert_eq!(
            listed,
            vec!["runs/p/r/notes.md".to_string(), "runs/p/r/reviewers/a.md".to_string()]
        );

        let error = store
            .put("runs/p/r/notes.md", b"again")
            .await
            .expect_err("rewrite must fail");
        assert!(matches!(error, StoreError::Conflict(_)));
    }
}
