use crate::handlers::{Evaluation, HandlerFailure, HandlerOutcome, RepositoryContext, render_prompt};
use crate::{EngineError, EngineState};
use futures::StreamExt;
use gyre_graph::{AttrValue, Graph, Node};
use gyre_llm::{ModelConfig, ModelEvent, ModelRequest, ProviderRegistry};
use serde_json::Value;
use std::time::Duration;

/// Invoke the configured language model for one node attempt. Token deltas
/// are forwarded through `on_delta` as they arrive; the final assistant text
/// is the node output.
pub async fn run_model_node(
    node: &Node,
    graph: &Graph,
    state: &EngineState,
    repository: &RepositoryContext,
    run_config: &ModelConfig,
    providers: &ProviderRegistry,
    on_delta: &(dyn Fn(String) + Send + Sync),
) -> Result<Evaluation, EngineError> {
    let request = build_request(node, graph, state, repository, run_config);
    let provider_name = node
        .attrs
        .get_str("provider")
        .unwrap_or(run_config.provider.as_str())
        .to_string();

    let provider = match providers.resolve(&provider_name) {
        Ok(provider) => provider,
        Err(error) => return Ok(Evaluation::Failure(HandlerFailure::fatal(error.to_string()))),
    };

    let timeout_ms = request.timeout_ms;
    let stream = match provider.stream(request).await {
        Ok(stream) => stream,
        Err(error) => {
            return Ok(Evaluation::Failure(HandlerFailure {
                retriable: error.is_retriable(),
                reason: error.to_string(),
            }));
        }
    };

    let collect = collect_stream(stream, on_delta);
    let collected = match timeout_ms {
        Some(bound) => match tokio::time::timeout(Duration::from_millis(bound), collect).await {
            Ok(collected) => collected,
            Err(_) => {
                return Ok(Evaluation::Failure(HandlerFailure::transient(format!(
                    "model call exceeded {bound} ms"
                ))));
            }
        },
        None => collect.await,
    };

    match collected {
        Collected::Completed(text) => {
            let mut outcome = HandlerOutcome::with_output(text.clone());
            if let Some(key) = node.attrs.get_str("output") {
                outcome
                    .context_updates
                    .insert(key.to_string(), Value::String(text));
            }
            Ok(Evaluation::Success(outcome))
        }
        Collected::Failed { message, retriable } => Ok(Evaluation::Failure(HandlerFailure {
            reason: message,
            retriable,
        })),
    }
}

enum Collected {
    Completed(String),
    Failed { message: String, retriable: bool },
}

async fn collect_stream(
    mut stream: gyre_llm::ModelEventStream,
    on_delta: &(dyn Fn(String) + Send + Sync),
) -> Collected {
    let mut accumulated = String::new();
    let mut completed: Option<String> = None;

    while let Some(event) = stream.next().await {
        match event {
            ModelEvent::Delta { text } => {
                accumulated.push_str(&text);
                on_delta(text);
            }
            ModelEvent::Completed { text } => completed = Some(text),
            ModelEvent::Failed { message, retriable } => {
                return Collected::Failed { message, retriable };
            }
        }
    }

    Collected::Completed(completed.unwrap_or(accumulated))
}

fn build_request(
    node: &Node,
    graph: &Graph,
    state: &EngineState,
    repository: &RepositoryContext,
    run_config: &ModelConfig,
) -> ModelRequest {
    let template = node
        .attrs
        .get_str("prompt")
        .filter(|prompt| !prompt.trim().is_empty())
        .or_else(|| node.attrs.get_str("label"))
        .unwrap_or(node.id.as_str());
    let prompt = render_prompt(template, graph, state, repository);

    let model = node
        .attrs
        .get_str("model")
        .or_else(|| node.attrs.get_str("model_id"))
        .unwrap_or(run_config.model.as_str())
        .to_string();

    ModelRequest {
        model,
        prompt,
        temperature: node
            .attrs
            .get("temperature")
            .and_then(AttrValue::as_f64)
            .or(run_config.temperature),
        max_tokens: node
            .attrs
            .get_i64("max_tokens")
            .and_then(|tokens| u32::try_from(tokens).ok())
            .or(run_config.max_tokens),
        reasoning: node
            .attrs
            .get_str("reasoning")
            .map(ToOwned::to_owned)
            .or_else(|| run_config.reasoning.clone()),
        timeout_ms: node
            .attrs
            .get("timeout_ms")
            .and_then(AttrValue::as_millis)
            .or_else(|| {
                graph
                    .attrs
                    .get("default_timeout_ms")
                    .and_then(AttrValue::as_millis)
            }),
    }
}
