use crate::handlers::{Evaluation, HandlerFailure, HandlerOutcome};
use crate::EngineError;
use gyre_graph::{AttrValue, Graph, Node};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;

/// Invoke the node's named command in the working tree with a bounded
/// environment and wall clock. Stdout becomes the node output; a non-zero
/// exit is a failure classified as transient for the retry policy.
pub async fn run_tool_node(
    node: &Node,
    graph: &Graph,
    run_id: &str,
    workdir: &Path,
) -> Result<Evaluation, EngineError> {
    let command_line = node.attrs.get_str("tool").map(str::trim).unwrap_or_default();
    if command_line.is_empty() {
        return Ok(Evaluation::Failure(HandlerFailure::fatal(
            "tool node has no command",
        )));
    }

    let timeout_ms = node
        .attrs
        .get("timeout_ms")
        .and_then(AttrValue::as_millis)
        .or_else(|| {
            graph
                .attrs
                .get("default_timeout_ms")
                .and_then(AttrValue::as_millis)
        })
        .unwrap_or(DEFAULT_TOOL_TIMEOUT_MS);

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(command_line)
        .current_dir(workdir)
        .env_clear()
        .env("GYRE_RUN_ID", run_id)
        .env("GYRE_NODE_ID", &node.id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for inherited in ["PATH", "HOME", "LANG"] {
        if let Ok(value) = std::env::var(inherited) {
            command.env(inherited, value);
        }
    }

    let mut child = command.spawn().map_err(|error| {
        EngineError::Runtime(format!("failed to spawn tool '{command_line}': {error}"))
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let wait = async {
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_string(&mut stdout).await.ok();
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_string(&mut stderr).await.ok();
        }
        let status = child.wait().await;
        (status, stdout, stderr)
    };

    let (status, stdout, stderr) =
        match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(result) => result,
            Err(_) => {
                return Ok(Evaluation::Failure(HandlerFailure::transient(format!(
                    "tool '{command_line}' exceeded {timeout_ms} ms"
                ))));
            }
        };

    let status = status.map_err(|error| {
        EngineError::Runtime(format!("failed to wait for tool '{command_line}': {error}"))
    })?;

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        let detail = stderr.trim();
        return Ok(Evaluation::Failure(HandlerFailure::transient(format!(
            "tool '{command_line}' exited with {code}: {detail}"
        ))));
    }

    let mut outcome = HandlerOutcome::with_output(stdout.clone());
    if let Some(key) = node.attrs.get_str("output") {
        outcome
            .context_updates
            .insert(key.to_string(), Value::String(stdout));
    }
    Ok(Evaluation::Success(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_graph::parse;
    use tempfile::TempDir;

    fn tool_graph(attrs: &str) -> gyre_graph::Graph {
        parse(&format!("digraph g {{ t [shape=parallelogram, {attrs}] }}"))
            .expect("graph should parse")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_tool_node_captures_stdout() {
        let temp = TempDir::new().expect("temp dir creates");
        let graph = tool_graph(r#"tool="printf hello""#);
        let node = graph.nodes.get("t").expect("node exists");

        let evaluation = run_tool_node(node, &graph, "run-1", temp.path())
            .await
            .expect("evaluation should succeed");
        match evaluation {
            Evaluation::Success(outcome) => assert_eq!(outcome.output.as_deref(), Some("hello")),
            other => panic!("unexpected evaluation: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_tool_node_nonzero_exit_expected_transient_failure() {
        let temp = TempDir::new().expect("temp dir creates");
        let graph = tool_graph(r#"tool="echo nope >&2; exit 3""#);
        let node = graph.nodes.get("t").expect("node exists");

        let evaluation = run_tool_node(node, &graph, "run-1", temp.path())
            .await
            .expect("evaluation should succeed");
        match evaluation {
            Evaluation::Failure(failure) => {
                assert!(failure.retriable);
                assert!(failure.reason.contains("exited with 3"));
                assert!(failure.reason.contains("nope"));
            }
            other => panic!("unexpected evaluation: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_tool_node_missing_command_expected_fatal() {
        let temp = TempDir::new().expect("temp dir creates");
        let graph = parse("digraph g { t [shape=parallelogram] }").expect("graph parses");
        let node = graph.nodes.get("t").expect("node exists");

        let evaluation = run_tool_node(node, &graph, "run-1", temp.path())
            .await
            .expect("evaluation should succeed");
        match evaluation {
            Evaluation::Failure(failure) => assert!(!failure.retriable),
            other => panic!("unexpected evaluation: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_tool_node_timeout_expected_transient_failure() {
        let temp = TempDir::new().expect("temp dir creates");
        let graph = tool_graph(r#"tool="sleep 5", timeout_ms=50"#);
        let node = graph.nodes.get("t").expect("node exists");

        let evaluation = run_tool_node(node, &graph, "run-1", temp.path())
            .await
            .expect("evaluation should succeed");
        match evaluation {
            Evaluation::Failure(failure) => {
                assert!(failure.retriable);
                assert!(failure.reason.contains("exceeded"));
            }
            other => panic!("unexpected evaluation: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_tool_node_environment_is_bounded() {
        let temp = TempDir::new().expect("temp dir creates");
        // SECRET must not leak into the staged environment; GYRE_NODE_ID must.
        unsafe { std::env::set_var("GYRE_TEST_SECRET", "leak") };
        let graph = tool_graph(r#"tool="printf '%s|%s' \"$GYRE_TEST_SECRET\" \"$GYRE_NODE_ID\"""#);
        let node = graph.nodes.get("t").expect("node exists");

        let evaluation = run_tool_node(node, &graph, "run-1", temp.path())
            .await
            .expect("evaluation should succeed");
        unsafe { std::env::remove_var("GYRE_TEST_SECRET") };
        match evaluation {
            Evaluation::Success(outcome) => assert_eq!(outcome.output.as_deref(), Some("|t")),
            other => panic!("unexpected evaluation: {other:?}"),
        }
    }
}
