use crate::{ArtifactRecord, ControlError, ControlResult, SharedControlStore};
use gyre_store::{SharedObjectStore, dedupe_artifact_key, normalize_artifact_key, run_artifact_path};
use uuid::Uuid;

/// Registers run artifacts: normalizes keys, resolves collisions with
/// `-2`/`-3` suffixes, writes the blob, and inserts the registry row.
pub struct ArtifactRegistrar {
    store: SharedControlStore,
    objects: SharedObjectStore,
    project_id: String,
    run_id: String,
    taken: Vec<String>,
}

impl ArtifactRegistrar {
    pub fn new(
        store: SharedControlStore,
        objects: SharedObjectStore,
        project_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            objects,
            project_id: project_id.into(),
            run_id: run_id.into(),
            taken: Vec::new(),
        }
    }

    pub async fn register(
        &mut self,
        raw_key: &str,
        content: &[u8],
        content_type: Option<&str>,
    ) -> ControlResult<ArtifactRecord> {
        let key = normalize_artifact_key(raw_key).ok_or_else(|| {
            ControlError::Validation(format!("artifact key '{raw_key}' normalizes to nothing"))
        })?;
        let key = dedupe_artifact_key(&key, &self.taken);
        let path = run_artifact_path(&self.project_id, &self.run_id, &key);

        self.objects.put(&path, content).await?;
        let record = self
            .store
            .insert_artifact(ArtifactRecord {
                id: Uuid::new_v4().to_string(),
                run_id: self.run_id.clone(),
                key: key.clone(),
                path,
                content_type: content_type.map(ToOwned::to_owned),
                size_bytes: Some(content.len() as u64),
            })
            .await?;
        self.taken.push(key);
        Ok(record)
    }

    pub fn keys(&self) -> &[String] {
        &self.taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryControlStore;
    use gyre_store::MemoryObjectStore;
    use std::sync::Arc;

    fn registrar() -> ArtifactRegistrar {
        ArtifactRegistrar::new(
            Arc::new(MemoryControlStore::new()),
            Arc::new(MemoryObjectStore::new()),
            "p-1",
            "r-1",
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn register_normalizes_and_dedupes_keys() {
        let mut registrar = registrar();
        let first = registrar
            .register("reviewers/security.md", b"one", Some("text/markdown"))
            .await
            .expect("first register");
        assert_eq!(first.key, "reviewers/security.md");
        assert_eq!(first.path, "runs/p-1/r-1/reviewers/security.md");

        let second = registrar
            .register("/reviewers/../reviewers/security.md", b"two", None)
            .await
            .expect("second register");
        assert_eq!(second.key, "reviewers/security-2.md");

        let third = registrar
            .register("reviewers/security.md", b"three", None)
            .await
            .expect("third register");
        assert_eq!(third.key, "reviewers/security-3.md");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn register_rejects_empty_keys() {
        let mut registrar = registrar();
        let error = registrar
            .register("../..", b"x", None)
            .await
            .expect_err("traversal-only key fails");
        assert!(matches!(error, ControlError::Validation(_)));
    }
}
