use crate::{LlmError, ModelEvent, ModelEventStream, ModelProvider, ModelRequest, SseParser};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

/// Streaming HTTP provider speaking a messages-style SSE protocol:
/// `content_block_delta` events carry text deltas, `message_stop` ends the
/// turn, `error` events fail it.
pub struct HttpModelProvider {
    name: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpModelProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "stream": true,
            "max_tokens": request.max_tokens.unwrap_or(8_192),
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(reasoning) = request.reasoning.as_deref() {
            body["reasoning"] = json!({ "effort": reasoning });
        }
        body
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelEventStream, LlmError> {
        let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("accept", "text/event-stream")
            .timeout(Duration::from_millis(timeout_ms))
            .json(&Self::request_body(&request))
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    LlmError::Timeout(timeout_ms)
                } else {
                    LlmError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retriable = status.is_server_error() || status.as_u16() == 429;
            return Err(LlmError::Provider {
                message: format!("provider returned {status}: {body}"),
                retriable,
            });
        }

        let byte_stream = response.bytes_stream();
        let events = futures::stream::unfold(
            StreamState {
                bytes: Box::pin(byte_stream),
                parser: Some(SseParser::new()),
                accumulated: String::new(),
                pending: Vec::new(),
                done: false,
            },
            next_event,
        );
        Ok(Box::pin(events))
    }
}

struct StreamState {
    bytes: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    parser: Option<SseParser>,
    accumulated: String,
    pending: Vec<ModelEvent>,
    done: bool,
}

async fn next_event(mut state: StreamState) -> Option<(ModelEvent, StreamState)> {
    loop {
        if !state.pending.is_empty() {
            let event = state.pending.remove(0);
            return Some((event, state));
        }
        if state.done {
            return None;
        }

        match state.bytes.next().await {
            Some(Ok(chunk)) => {
                let text = String::from_utf8_lossy(&chunk).to_string();
                if let Some(parser) = state.parser.as_mut() {
                    for sse in parser.push(&text) {
                        absorb_sse(&mut state.pending, &mut state.accumulated, &sse.data);
                    }
                }
            }
            Some(Err(error)) => {
                state.done = true;
                state.pending.push(ModelEvent::Failed {
                    message: format!("stream transport failure: {error}"),
                    retriable: true,
                });
            }
            None => {
                state.done = true;
                if let Some(parser) = state.parser.take() {
                    if let Some(tail) = parser.finish() {
                        absorb_sse(&mut state.pending, &mut state.accumulated, &tail.data);
                    }
                }
                if !state
                    .pending
                    .iter()
                    .any(|event| matches!(event, ModelEvent::Completed { .. } | ModelEvent::Failed { .. }))
                {
                    state.pending.push(ModelEvent::Completed {
                        text: state.accumulated.clone(),
                    });
                }
            }
        }
    }
}

fn absorb_sse(pending: &mut Vec<ModelEvent>, accumulated: &mut String, data: &str) {
    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return;
    }
    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        return;
    };
    match payload.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            if let Some(text) = payload
                .pointer("/delta/text")
                .and_then(Value::as_str)
            {
                accumulated.push_str(text);
                pending.push(ModelEvent::Delta {
                    text: text.to_string(),
                });
            }
        }
        Some("message_stop") => {
            pending.push(ModelEvent::Completed {
                text: accumulated.clone(),
            });
        }
        Some("error") => {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("provider stream error")
                .to_string();
            pending.push(ModelEvent::Failed {
                message,
                retriable: false,
            });
        }
        _ => {}
    }
}
