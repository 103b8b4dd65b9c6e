use crate::{LlmError, ModelConfig};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub max_output_tokens: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ProviderCatalog {
    models_by_provider: BTreeMap<String, Vec<ModelSpec>>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The providers and models known out of the box.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.add_model("anthropic", "claude-sonnet-4-5", 64_000);
        catalog.add_model("anthropic", "claude-opus-4-1", 32_000);
        catalog.add_model("openai", "gpt-5", 128_000);
        catalog.add_model("openai", "gpt-5-mini", 128_000);
        catalog
    }

    pub fn add_model(&mut self, provider: &str, model: &str, max_output_tokens: u32) {
        self.models_by_provider
            .entry(provider.to_string())
            .or_default()
            .push(ModelSpec {
                id: model.to_string(),
                max_output_tokens,
            });
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.models_by_provider.contains_key(provider)
    }

    pub fn find_model(&self, provider: &str, model: &str) -> Option<&ModelSpec> {
        self.models_by_provider
            .get(provider)?
            .iter()
            .find(|spec| spec.id == model)
    }

    /// Create-run precondition: provider and model present, numeric fields
    /// in range.
    pub fn validate_config(&self, config: &ModelConfig) -> Result<(), LlmError> {
        if !self.has_provider(&config.provider) {
            return Err(LlmError::UnknownProvider(config.provider.clone()));
        }
        let spec = self
            .find_model(&config.provider, &config.model)
            .ok_or_else(|| LlmError::UnknownModel {
                provider: config.provider.clone(),
                model: config.model.clone(),
            })?;

        if let Some(temperature) = config.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(LlmError::Configuration(format!(
                    "temperature {temperature} is out of range 0..=2"
                )));
            }
        }
        if let Some(max_tokens) = config.max_tokens {
            if max_tokens == 0 || max_tokens > spec.max_output_tokens {
                return Err(LlmError::Configuration(format!(
                    "max_tokens {max_tokens} is out of range 1..={}",
                    spec.max_output_tokens
                )));
            }
        }
        if let Some(reasoning) = config.reasoning.as_deref() {
            if !matches!(reasoning, "low" | "medium" | "high") {
                return Err(LlmError::Configuration(format!(
                    "reasoning '{reasoning}' must be low|medium|high"
                )));
            }
        }
        Ok(())
    }
}

/// Effective provider secrets: project scope shadows global scope.
#[async_trait]
pub trait SecretsSource: Send + Sync {
    async fn provider_secret(&self, project_id: &str, provider: &str) -> Option<String>;
}

pub type SharedSecretsSource = Arc<dyn SecretsSource>;

#[derive(Clone, Default)]
pub struct MemorySecrets {
    state: Arc<Mutex<SecretsState>>,
}

#[derive(Default)]
struct SecretsState {
    project: BTreeMap<(String, String), String>,
    global: BTreeMap<String, String>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_project_secret(&self, project_id: &str, provider: &str, secret: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.project.insert(
                (project_id.to_string(), provider.to_string()),
                secret.to_string(),
            );
        }
    }

    pub fn set_global_secret(&self, provider: &str, secret: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.global.insert(provider.to_string(), secret.to_string());
        }
    }
}

#[async_trait]
impl SecretsSource for MemorySecrets {
    async fn provider_secret(&self, project_id: &str, provider: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .project
            .get(&(project_id.to_string(), provider.to_string()))
            .or_else(|| state.global.get(provider))
            .cloned()
    }
}
