use crate::EngineState;
use gyre_graph::Graph;

/// A terminal-output artifact selected from engine state, keyed relative to
/// the run's artifact prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedArtifact {
    pub key: String,
    pub node_id: String,
    pub content: String,
}

/// The node output rendered as the final report: `final_output_node` when
/// set, otherwise the last completed node that produced non-empty output.
pub fn final_output(graph: &Graph, state: &EngineState) -> Option<(String, String)> {
    if let Some(node_id) = graph.attrs.get_str("final_output_node") {
        return state
            .node_outputs
            .get(node_id)
            .map(|output| (node_id.to_string(), output.clone()));
    }
    state.completed_nodes.iter().rev().find_map(|node_id| {
        state
            .node_outputs
            .get(node_id)
            .filter(|output| !output.trim().is_empty())
            .map(|output| (node_id.clone(), output.clone()))
    })
}

/// Node ids listed in the graph's `reviewer_artifact_nodes` attribute.
pub fn reviewer_nodes(graph: &Graph) -> Vec<String> {
    graph
        .attrs
        .get_str("reviewer_artifact_nodes")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|node_id| !node_id.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Artifact set for task runs: per-reviewer markdown plus the final report.
/// Keys are raw here; the registrar normalizes and de-duplicates them.
pub fn collect_task_artifacts(graph: &Graph, state: &EngineState) -> Vec<SelectedArtifact> {
    let mut artifacts = Vec::new();

    for node_id in reviewer_nodes(graph) {
        if let Some(output) = state.node_outputs.get(&node_id) {
            artifacts.push(SelectedArtifact {
                key: format!("reviewers/{node_id}.md"),
                node_id,
                content: output.clone(),
            });
        }
    }

    if let Some((node_id, content)) = final_output(graph, state) {
        let key = graph
            .attrs
            .get_str("final_artifact_key")
            .unwrap_or("final-report.md")
            .to_string();
        artifacts.push(SelectedArtifact {
            key,
            node_id,
            content,
        });
    }

    artifacts
}

/// Whether the graph opts into in-graph implementation (no spec bundle).
pub fn in_graph_implementation(graph: &Graph) -> bool {
    graph.attrs.get_str("implementation_mode") == Some("dot")
}

pub fn looks_like_diff(text: &str) -> bool {
    text.contains("diff --git ")
}

/// Patch and summary selection for in-graph implementation runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImplementationSelection {
    pub patch_node: String,
    pub patch_text: String,
    pub summary_text: Option<String>,
}

/// `implementation_patch_node` when set, otherwise the last completed node
/// whose output contains a unified diff.
pub fn select_implementation(graph: &Graph, state: &EngineState) -> Option<ImplementationSelection> {
    let patch_node = graph
        .attrs
        .get_str("implementation_patch_node")
        .map(ToString::to_string)
        .or_else(|| {
            state
                .completed_nodes
                .iter()
                .rev()
                .find(|node_id| {
                    state
                        .node_outputs
                        .get(*node_id)
                        .is_some_and(|output| looks_like_diff(output))
                })
                .cloned()
        })?;
    let patch_text = state.node_outputs.get(&patch_node)?.clone();

    let summary_text = graph
        .attrs
        .get_str("implementation_summary_node")
        .and_then(|node_id| state.node_outputs.get(node_id))
        .cloned();

    Some(ImplementationSelection {
        patch_node,
        patch_text,
        summary_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutcomeStatus;
    use gyre_graph::parse;

    fn state_with(outputs: &[(&str, &str)]) -> EngineState {
        let mut state = EngineState::new();
        for (node_id, output) in outputs {
            state.record_output(node_id, Some(output.to_string()));
            state.record_outcome(node_id, OutcomeStatus::Succeeded, None, 1);
        }
        state
    }

    #[test]
    fn final_output_prefers_graph_attr() {
        let graph = parse(r#"digraph g { graph [final_output_node="summary"] a; summary }"#)
            .expect("graph parses");
        let state = state_with(&[("a", "ignored"), ("summary", "the report")]);
        assert_eq!(
            final_output(&graph, &state),
            Some(("summary".to_string(), "the report".to_string()))
        );
    }

    #[test]
    fn final_output_falls_back_to_last_non_empty() {
        let graph = parse("digraph g { a; b; c }").expect("graph parses");
        let state = state_with(&[("a", "first"), ("b", "second"), ("c", "   ")]);
        assert_eq!(
            final_output(&graph, &state),
            Some(("b".to_string(), "second".to_string()))
        );
    }

    #[test]
    fn collect_task_artifacts_reviewers_and_report() {
        let graph = parse(
            r#"digraph g {
                graph [reviewer_artifact_nodes="sec_review, style_review", final_artifact_key="report.md"]
                sec_review; style_review; summary
            }"#,
        )
        .expect("graph parses");
        let state = state_with(&[
            ("sec_review", "security notes"),
            ("style_review", "style notes"),
            ("summary", "done"),
        ]);

        let artifacts = collect_task_artifacts(&graph, &state);
        let keys: Vec<&str> = artifacts.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["reviewers/sec_review.md", "reviewers/style_review.md", "report.md"]
        );
    }

    #[test]
    fn select_implementation_falls_back_to_diff_scan() {
        let graph = parse(r#"digraph g { graph [implementation_mode="dot"] plan; impl }"#)
            .expect("graph parses");
        assert!(in_graph_implementation(&graph));
        let state = state_with(&[
            ("plan", "no patch here"),
            ("impl", "diff --git a/x b/x\n+new"),
        ]);

        let selection = select_implementation(&graph, &state).expect("selection exists");
        assert_eq!(selection.patch_node, "impl");
        assert!(looks_like_diff(&selection.patch_text));
        assert_eq!(selection.summary_text, None);
    }

    #[test]
    fn select_implementation_without_diff_expected_none() {
        let graph = parse("digraph g { plan }").expect("graph parses");
        let state = state_with(&[("plan", "prose only")]);
        assert_eq!(select_implementation(&graph, &state), None);
    }
}
