use serde::{Deserialize, Serialize};

/// Model configuration carried by an attractor definition and snapshotted
/// onto every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ModelRequest {
    pub fn from_config(config: &ModelConfig, prompt: impl Into<String>) -> Self {
        Self {
            model: config.model.clone(),
            prompt: prompt.into(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            reasoning: config.reasoning.clone(),
            timeout_ms: None,
        }
    }
}

/// One element of the lazy, finite, non-restartable provider stream. The
/// final assistant text is the last `Completed` payload; `Failed` terminates
/// the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelEvent {
    Delta { text: String },
    Completed { text: String },
    Failed { message: String, retriable: bool },
}

pub type ModelEventStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = ModelEvent> + Send + 'static>>;
