use crate::{
    ControlConfig, EventLog, MemoryControlStore, MemoryRunBus, QuestionService, SharedControlStore,
    SharedRunBus,
};
use gyre_llm::{MemorySecrets, ProviderCatalog, ProviderRegistry, SharedSecretsSource};
use gyre_scm::{MemorySourceControlHost, SharedSourceControlHost};
use gyre_store::{
    AttractorStore, MemoryAttractorRegistry, MemoryObjectStore, SharedObjectStore,
};
use std::sync::Arc;

/// Everything the handlers, dispatcher, and workers need, constructed once
/// at process init and passed explicitly. No process-wide mutable state.
pub struct Services {
    pub config: ControlConfig,
    pub store: SharedControlStore,
    pub objects: SharedObjectStore,
    pub attractors: AttractorStore,
    pub bus: SharedRunBus,
    pub events: EventLog,
    pub catalog: ProviderCatalog,
    pub secrets: SharedSecretsSource,
    pub providers: ProviderRegistry,
    pub host: SharedSourceControlHost,
    pub questions: QuestionService,
}

impl Services {
    /// Fully in-memory service bundle for tests and the CLI demo. Callers
    /// typically register providers and secrets before wrapping in `Arc`.
    pub fn in_memory(config: ControlConfig) -> Self {
        let store: SharedControlStore = Arc::new(MemoryControlStore::new());
        let objects: SharedObjectStore = Arc::new(MemoryObjectStore::new());
        let attractors = AttractorStore::new(
            Arc::clone(&objects),
            Arc::new(MemoryAttractorRegistry::new()),
        );
        let bus: SharedRunBus = Arc::new(MemoryRunBus::new());
        let events = EventLog::new(Arc::clone(&store));
        let questions = QuestionService::new(Arc::clone(&store));

        Self {
            config,
            store: Arc::clone(&store),
            objects,
            attractors,
            bus,
            events,
            catalog: ProviderCatalog::builtin(),
            secrets: Arc::new(MemorySecrets::new()),
            providers: ProviderRegistry::new(),
            host: Arc::new(MemorySourceControlHost::new()),
            questions,
        }
    }
}
