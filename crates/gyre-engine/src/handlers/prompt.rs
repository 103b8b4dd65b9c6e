use crate::EngineState;
use gyre_graph::Graph;

/// Repository view handed to model prompts: a file listing and a textual
/// snapshot of the working tree at clone time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RepositoryContext {
    pub tree: String,
    pub snapshot: String,
}

/// Expand prompt placeholders:
/// `$output.<node>` (prior node outputs), `$context.<key>`,
/// `$repository_tree`, `$repository_snapshot`, and `$goal`.
pub fn render_prompt(
    template: &str,
    graph: &Graph,
    state: &EngineState,
    repository: &RepositoryContext,
) -> String {
    let mut rendered = template.to_string();

    for (node_id, output) in &state.node_outputs {
        let needle = format!("$output.{node_id}");
        if rendered.contains(&needle) {
            rendered = rendered.replace(&needle, output);
        }
    }
    for key in state.context.keys() {
        let needle = format!("$context.{key}");
        if rendered.contains(&needle) {
            if let Some(value) = state.context_str(key) {
                rendered = rendered.replace(&needle, &value);
            }
        }
    }

    rendered = rendered.replace("$repository_tree", &repository.tree);
    rendered = rendered.replace("$repository_snapshot", &repository.snapshot);

    if let Some(goal) = graph.attrs.get_str("goal") {
        rendered = rendered.replace("$goal", goal);
    }

    rendered
}
