use crate::{
    SharedObjectStore, StoreError, StoreResult, global_attractor_path, project_attractor_path,
};
use async_trait::async_trait;
use gyre_graph::{Diagnostic, apply_model_stylesheet, canonicalize, parse, validate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttractorScope {
    Global,
    Project,
}

/// Project-scoped attractor definition. GLOBAL-scope rows are read-only
/// mirrors maintained by promotion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttractorDefRecord {
    pub id: String,
    pub project_id: String,
    pub scope: AttractorScope,
    pub name: String,
    pub content_path: Option<String>,
    pub content_version: u32,
    pub content_sha256: Option<String>,
    pub default_run_type: String,
    pub model_config: Value,
    pub active: bool,
    pub description: Option<String>,
    pub global_source_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalAttractorRecord {
    pub id: String,
    pub name: String,
    pub content_path: Option<String>,
    pub content_version: u32,
    pub content_sha256: Option<String>,
    pub default_run_type: String,
    pub model_config: Value,
    pub description: Option<String>,
}

/// One immutable content version; `(parent_id, version)` is unique and
/// versions are strictly increasing per parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttractorVersionRecord {
    pub parent_id: String,
    pub version: u32,
    pub content_path: String,
    pub content_sha256: String,
    pub size_bytes: u64,
}

/// Snapshot pinned onto a run at creation time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttractorPin {
    pub content_path: String,
    pub content_version: u32,
    pub content_sha256: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PutOutcome {
    pub parent_id: String,
    pub content_path: String,
    pub content_version: u32,
    pub content_sha256: String,
    pub created_version: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Relational rows behind the attractor store; the real deployment backs
/// this with the shared database, tests and the CLI use the memory variant.
#[async_trait]
pub trait AttractorRegistry: Send + Sync {
    async fn get_def(&self, id: &str) -> StoreResult<AttractorDefRecord>;
    async fn find_def(
        &self,
        project_id: &str,
        name: &str,
        scope: AttractorScope,
    ) -> StoreResult<Option<AttractorDefRecord>>;
    async fn upsert_def(&self, record: AttractorDefRecord) -> StoreResult<AttractorDefRecord>;

    async fn get_global(&self, id: &str) -> StoreResult<GlobalAttractorRecord>;
    async fn find_global(&self, name: &str) -> StoreResult<Option<GlobalAttractorRecord>>;
    async fn upsert_global(&self, record: GlobalAttractorRecord)
    -> StoreResult<GlobalAttractorRecord>;

    async fn latest_version(&self, parent_id: &str) -> StoreResult<Option<AttractorVersionRecord>>;
    async fn insert_version(&self, record: AttractorVersionRecord) -> StoreResult<()>;
    async fn list_versions(&self, parent_id: &str) -> StoreResult<Vec<AttractorVersionRecord>>;
    async fn get_version(&self, parent_id: &str, version: u32)
    -> StoreResult<AttractorVersionRecord>;
}

pub type SharedAttractorRegistry = Arc<dyn AttractorRegistry>;

#[derive(Clone, Debug, Default)]
struct RegistryState {
    defs: BTreeMap<String, AttractorDefRecord>,
    globals: BTreeMap<String, GlobalAttractorRecord>,
    versions: BTreeMap<(String, u32), AttractorVersionRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryAttractorRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl MemoryAttractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, RegistryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("attractor registry mutex poisoned".to_string()))
    }
}

#[async_trait]
impl AttractorRegistry for MemoryAttractorRegistry {
    async fn get_def(&self, id: &str) -> StoreResult<AttractorDefRecord> {
        self.lock()?
            .defs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "attractor_def",
                id: id.to_string(),
            })
    }

    async fn find_def(
        &self,
        project_id: &str,
        name: &str,
        scope: AttractorScope,
    ) -> StoreResult<Option<AttractorDefRecord>> {
        Ok(self.lock()?.defs.values().find(|def| {
            def.project_id == project_id && def.name == name && def.scope == scope
        }).cloned())
    }

    async fn upsert_def(&self, record: AttractorDefRecord) -> StoreResult<AttractorDefRecord> {
        let mut state = self.lock()?;
        let duplicate = state.defs.values().any(|existing| {
            existing.id != record.id
                && existing.project_id == record.project_id
                && existing.name == record.name
                && existing.scope == record.scope
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "attractor '{}' already exists in project '{}' at this scope",
                record.name, record.project_id
            )));
        }
        state.defs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_global(&self, id: &str) -> StoreResult<GlobalAttractorRecord> {
        self.lock()?
            .globals
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "global_attractor",
                id: id.to_string(),
            })
    }

    async fn find_global(&self, name: &str) -> StoreResult<Option<GlobalAttractorRecord>> {
        Ok(self
            .lock()?
            .globals
            .values()
            .find(|global| global.name == name)
            .cloned())
    }

    async fn upsert_global(
        &self,
        record: GlobalAttractorRecord,
    ) -> StoreResult<GlobalAttractorRecord> {
        let mut state = self.lock()?;
        let duplicate = state
            .globals
            .values()
            .any(|existing| existing.id != record.id && existing.name == record.name);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "global attractor '{}' already exists",
                record.name
            )));
        }
        state.globals.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn latest_version(&self, parent_id: &str) -> StoreResult<Option<AttractorVersionRecord>> {
        Ok(self
            .lock()?
            .versions
            .range((parent_id.to_string(), 0)..=(parent_id.to_string(), u32::MAX))
            .next_back()
            .map(|(_, record)| record.clone()))
    }

    async fn insert_version(&self, record: AttractorVersionRecord) -> StoreResult<()> {
        let mut state = self.lock()?;
        let key = (record.parent_id.clone(), record.version);
        if state.versions.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "version {} already exists for '{}'",
                record.version, record.parent_id
            )));
        }
        state.versions.insert(key, record);
        Ok(())
    }

    async fn list_versions(&self, parent_id: &str) -> StoreResult<Vec<AttractorVersionRecord>> {
        Ok(self
            .lock()?
            .versions
            .range((parent_id.to_string(), 0)..=(parent_id.to_string(), u32::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn get_version(
        &self,
        parent_id: &str,
        version: u32,
    ) -> StoreResult<AttractorVersionRecord> {
        self.lock()?
            .versions
            .get(&(parent_id.to_string(), version))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "attractor_version",
                id: format!("{parent_id}/v{version}"),
            })
    }
}

/// Versioned attractor content store: canonicalize + lint on write, dedupe
/// by SHA-256, append-only versions, digest-verified pinning for runs.
#[derive(Clone)]
pub struct AttractorStore {
    objects: SharedObjectStore,
    registry: SharedAttractorRegistry,
}

impl AttractorStore {
    pub fn new(objects: SharedObjectStore, registry: SharedAttractorRegistry) -> Self {
        Self { objects, registry }
    }

    pub fn registry(&self) -> SharedAttractorRegistry {
        Arc::clone(&self.registry)
    }

    pub async fn put_global(
        &self,
        name: &str,
        content: &str,
        expected_content_version: Option<u32>,
    ) -> StoreResult<PutOutcome> {
        let prepared = prepare_content(content)?;
        let mut global = match self.registry.find_global(name).await? {
            Some(existing) => existing,
            None => {
                self.registry
                    .upsert_global(GlobalAttractorRecord {
                        id: Uuid::new_v4().to_string(),
                        name: name.to_string(),
                        content_path: None,
                        content_version: 0,
                        content_sha256: None,
                        default_run_type: "task".to_string(),
                        model_config: Value::Null,
                        description: None,
                    })
                    .await?
            }
        };
        check_expected_version(expected_content_version, global.content_version)?;

        let placement = self
            .write_version(&global.id, &prepared, |version| {
                global_attractor_path(name, version)
            })
            .await?;
        if placement.created_version {
            global.content_path = Some(placement.content_path.clone());
            global.content_version = placement.content_version;
            global.content_sha256 = Some(placement.content_sha256.clone());
            self.registry.upsert_global(global).await?;
        }
        Ok(placement)
    }

    pub async fn put_project(
        &self,
        project_id: &str,
        name: &str,
        content: &str,
        expected_content_version: Option<u32>,
    ) -> StoreResult<PutOutcome> {
        if self
            .registry
            .find_def(project_id, name, AttractorScope::Global)
            .await?
            .is_some()
            && self
                .registry
                .find_def(project_id, name, AttractorScope::Project)
                .await?
                .is_none()
        {
            return Err(StoreError::Precondition(format!(
                "attractor '{name}' is a promoted global mirror; edit it through the global endpoint"
            )));
        }

        let prepared = prepare_content(content)?;
        let mut def = match self
            .registry
            .find_def(project_id, name, AttractorScope::Project)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.registry
                    .upsert_def(AttractorDefRecord {
                        id: Uuid::new_v4().to_string(),
                        project_id: project_id.to_string(),
                        scope: AttractorScope::Project,
                        name: name.to_string(),
                        content_path: None,
                        content_version: 0,
                        content_sha256: None,
                        default_run_type: "task".to_string(),
                        model_config: Value::Null,
                        active: true,
                        description: None,
                        global_source_id: None,
                    })
                    .await?
            }
        };
        check_expected_version(expected_content_version, def.content_version)?;

        let placement = self
            .write_version(&def.id, &prepared, |version| {
                project_attractor_path(project_id, name, version)
            })
            .await?;
        if placement.created_version {
            def.content_path = Some(placement.content_path.clone());
            def.content_version = placement.content_version;
            def.content_sha256 = Some(placement.content_sha256.clone());
            self.registry.upsert_def(def).await?;
        }
        Ok(placement)
    }

    /// Mirror a global attractor into each project as a read-only
    /// GLOBAL-scope definition. Project-scope rows of the same name stay
    /// distinct.
    pub async fn promote(
        &self,
        global_id: &str,
        project_ids: &[String],
    ) -> StoreResult<Vec<AttractorDefRecord>> {
        let global = self.registry.get_global(global_id).await?;
        let mut mirrored = Vec::with_capacity(project_ids.len());

        for project_id in project_ids {
            let existing = self
                .registry
                .find_def(project_id, &global.name, AttractorScope::Global)
                .await?;
            let mirror = AttractorDefRecord {
                id: existing
                    .as_ref()
                    .map(|def| def.id.clone())
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                project_id: project_id.clone(),
                scope: AttractorScope::Global,
                name: global.name.clone(),
                content_path: global.content_path.clone(),
                content_version: global.content_version,
                content_sha256: global.content_sha256.clone(),
                default_run_type: global.default_run_type.clone(),
                model_config: global.model_config.clone(),
                active: true,
                description: global.description.clone(),
                global_source_id: Some(global.id.clone()),
            };
            mirrored.push(self.registry.upsert_def(mirror).await?);
        }

        Ok(mirrored)
    }

    /// Resolve the latest pointer of a definition for run pinning, verifying
    /// the stored content still matches the recorded digest. Definitions
    /// without storage-backed content are legacy-only and rejected.
    pub async fn pin_for_run(&self, def_id: &str) -> StoreResult<AttractorPin> {
        let def = self.registry.get_def(def_id).await?;
        let (Some(content_path), Some(content_sha256)) = (def.content_path, def.content_sha256)
        else {
            return Err(StoreError::Precondition(format!(
                "attractor '{}' has no storage-backed content; legacy repo-path definitions cannot be pinned",
                def.name
            )));
        };

        let blob = self.objects.get(&content_path).await?;
        let actual = sha256_hex(&blob);
        if actual != content_sha256 {
            return Err(StoreError::Conflict(format!(
                "attractor content at '{content_path}' does not match recorded digest"
            )));
        }

        Ok(AttractorPin {
            content_path,
            content_version: def.content_version,
            content_sha256,
        })
    }

    pub async fn list_versions(&self, parent_id: &str) -> StoreResult<Vec<AttractorVersionRecord>> {
        self.registry.list_versions(parent_id).await
    }

    pub async fn read_version(
        &self,
        parent_id: &str,
        version: u32,
    ) -> StoreResult<(AttractorVersionRecord, Vec<u8>)> {
        let record = self.registry.get_version(parent_id, version).await?;
        let blob = self.objects.get(&record.content_path).await?;
        Ok((record, blob))
    }

    async fn write_version(
        &self,
        parent_id: &str,
        prepared: &PreparedContent,
        path_for: impl Fn(u32) -> String,
    ) -> StoreResult<PutOutcome> {
        let latest = self.registry.latest_version(parent_id).await?;
        if let Some(latest) = &latest {
            if latest.content_sha256 == prepared.sha256 {
                return Ok(PutOutcome {
                    parent_id: parent_id.to_string(),
                    content_path: latest.content_path.clone(),
                    content_version: latest.version,
                    content_sha256: latest.content_sha256.clone(),
                    created_version: false,
                    diagnostics: prepared.diagnostics.clone(),
                });
            }
        }

        let version = latest.map(|latest| latest.version).unwrap_or(0) + 1;
        let content_path = path_for(version);
        self.objects
            .put(&content_path, prepared.canonical.as_bytes())
            .await?;
        self.registry
            .insert_version(AttractorVersionRecord {
                parent_id: parent_id.to_string(),
                version,
                content_path: content_path.clone(),
                content_sha256: prepared.sha256.clone(),
                size_bytes: prepared.canonical.len() as u64,
            })
            .await?;

        Ok(PutOutcome {
            parent_id: parent_id.to_string(),
            content_path,
            content_version: version,
            content_sha256: prepared.sha256.clone(),
            created_version: true,
            diagnostics: prepared.diagnostics.clone(),
        })
    }
}

struct PreparedContent {
    canonical: String,
    sha256: String,
    diagnostics: Vec<Diagnostic>,
}

fn prepare_content(content: &str) -> StoreResult<PreparedContent> {
    let graph = parse(content)
        .map_err(|error| StoreError::InvalidInput(format!("attractor content: {error}")))?;
    let canonical = canonicalize(&graph);

    let mut styled = graph;
    apply_model_stylesheet(&mut styled)
        .map_err(|error| StoreError::InvalidInput(format!("attractor stylesheet: {error}")))?;
    let diagnostics = validate(&styled, &[]);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(StoreError::InvalidContent(diagnostics));
    }

    let sha256 = sha256_hex(canonical.as_bytes());
    Ok(PreparedContent {
        canonical,
        sha256,
        diagnostics,
    })
}

fn check_expected_version(expected: Option<u32>, current: u32) -> StoreResult<()> {
    match expected {
        Some(expected) if expected != current => Err(StoreError::Conflict(format!(
            "expected content version {expected} but latest is {current}"
        ))),
        _ => Ok(()),
    }
}
