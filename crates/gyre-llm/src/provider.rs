use crate::{LlmError, ModelEvent, ModelEventStream, ModelRequest};
use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Provider adapter contract. Implementations stream events; the worker
/// forwards each event into the run event log.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, LlmError>;
}

pub type SharedModelProvider = Arc<dyn ModelProvider>;

/// Dispatch-only registry: resolves a provider by name. There is no
/// selection logic beyond the name recorded in the model configuration.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, SharedModelProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: SharedModelProvider) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn resolve(&self, name: &str) -> Result<SharedModelProvider, LlmError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }
}

/// One scripted turn for the mock provider.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Stream the text in word-sized deltas, then complete with the whole.
    Text(String),
    /// Fail mid-stream.
    Failure { message: String, retriable: bool },
}

/// Deterministic provider for tests and the CLI demo: answers are popped
/// from a queue, one per call; an exhausted queue echoes the prompt.
#[derive(Clone)]
pub struct ScriptedProvider {
    name: String,
    turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            name: name.into(),
            turns: Arc::new(Mutex::new(turns.into())),
        }
    }

    pub fn echoing(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn push(&self, turn: ScriptedTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, LlmError> {
        let turn = self
            .turns
            .lock()
            .map_err(|_| LlmError::Configuration("scripted provider mutex poisoned".to_string()))?
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::Text(format!("[scripted] {}", request.prompt)));

        let events = match turn {
            ScriptedTurn::Text(text) => {
                let mut events: Vec<ModelEvent> = text
                    .split_inclusive(' ')
                    .map(|chunk| ModelEvent::Delta {
                        text: chunk.to_string(),
                    })
                    .collect();
                events.push(ModelEvent::Completed { text });
                events
            }
            ScriptedTurn::Failure { message, retriable } => {
                vec![ModelEvent::Failed { message, retriable }]
            }
        };

        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request(prompt: &str) -> ModelRequest {
        ModelRequest {
            model: "scripted-model".to_string(),
            prompt: prompt.to_string(),
            temperature: None,
            max_tokens: None,
            reasoning: None,
            timeout_ms: None,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_provider_streams_deltas_then_completes() {
        let provider = ScriptedProvider::new(
            "anthropic",
            vec![ScriptedTurn::Text("plan the work".to_string())],
        );
        let events: Vec<ModelEvent> = provider
            .stream(request("ignored"))
            .await
            .expect("stream should open")
            .collect()
            .await;

        assert!(matches!(events.first(), Some(ModelEvent::Delta { .. })));
        assert_eq!(
            events.last(),
            Some(&ModelEvent::Completed {
                text: "plan the work".to_string()
            })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_provider_failure_turn_expected_failed_event() {
        let provider = ScriptedProvider::new(
            "anthropic",
            vec![ScriptedTurn::Failure {
                message: "overloaded".to_string(),
                retriable: true,
            }],
        );
        let events: Vec<ModelEvent> = provider
            .stream(request("x"))
            .await
            .expect("stream should open")
            .collect()
            .await;
        assert_eq!(
            events,
            vec![ModelEvent::Failed {
                message: "overloaded".to_string(),
                retriable: true
            }]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registry_resolution_expected_by_name_only() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::echoing("anthropic")));
        assert!(registry.resolve("anthropic").is_ok());
        assert!(matches!(
            registry.resolve("unknown"),
            Err(LlmError::UnknownProvider(_))
        ));
    }
}
