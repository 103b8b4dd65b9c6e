use crate::{
    AttrValue, Diagnostic, Graph, NodeType, Severity, ValidationError, parse_stylesheet,
};
use std::collections::{BTreeSet, VecDeque};

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_single_start(graph));
    diagnostics.extend(rule_has_terminal(graph));
    diagnostics.extend(rule_edge_targets_exist(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_terminal_no_outgoing(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_decision_selector(graph));
    diagnostics.extend(rule_parallel_fan_out(graph));
    diagnostics.extend(rule_numeric_attrs(graph));
    diagnostics.extend(rule_stylesheet_syntax(graph));
    diagnostics.extend(rule_known_type(graph));
    diagnostics.extend(rule_model_prompt(graph));
    diagnostics.extend(rule_tool_named(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_single_start(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.nodes_of_type(NodeType::Start);
    if starts.len() == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::new(
            "single_start",
            Severity::Error,
            format!("graph must have exactly one start node; found {}", starts.len()),
        )]
    }
}

fn rule_has_terminal(graph: &Graph) -> Vec<Diagnostic> {
    if graph.nodes_of_type(NodeType::Terminal).is_empty() {
        vec![Diagnostic::new(
            "has_terminal",
            Severity::Error,
            "graph must have at least one terminal node",
        )]
    } else {
        Vec::new()
    }
}

fn rule_edge_targets_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !graph.nodes.contains_key(endpoint) {
                diagnostics.push(
                    Diagnostic::new(
                        "edge_targets_exist",
                        Severity::Error,
                        format!("edge endpoint '{endpoint}' does not exist"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes_of_type(NodeType::Start)
        .into_iter()
        .filter(|start| graph.incoming_edges(&start.id).next().is_some())
        .map(|start| {
            Diagnostic::new(
                "start_no_incoming",
                Severity::Error,
                "start node must have no incoming edges",
            )
            .with_node_id(start.id.clone())
        })
        .collect()
}

fn rule_terminal_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes_of_type(NodeType::Terminal)
        .into_iter()
        .filter(|terminal| graph.outgoing_edges(&terminal.id).next().is_some())
        .map(|terminal| {
            Diagnostic::new(
                "terminal_no_outgoing",
                Severity::Error,
                "terminal node must have no outgoing edges",
            )
            .with_node_id(terminal.id.clone())
        })
        .collect()
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    let Some(start) = graph.start_node() else {
        return Vec::new();
    };

    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.id.clone());
    queue.push_back(start.id.clone());
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.outgoing_edges(&node_id) {
            if visited.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }

    graph
        .nodes
        .values()
        .filter(|node| !visited.contains(&node.id))
        .map(|node| {
            Diagnostic::new(
                "reachability",
                Severity::Error,
                "node is unreachable from start",
            )
            .with_node_id(node.id.clone())
        })
        .collect()
}

fn rule_decision_selector(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes_of_type(NodeType::Decision) {
        if node
            .attrs
            .get_str("selector")
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
        {
            diagnostics.push(
                Diagnostic::new(
                    "decision_selector",
                    Severity::Error,
                    "decision node must define a selector",
                )
                .with_node_id(node.id.clone()),
            );
        }
        let has_when_edge = graph.outgoing_edges(&node.id).any(|edge| {
            !edge
                .attrs
                .get_str("when")
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        });
        if !has_when_edge {
            diagnostics.push(
                Diagnostic::new(
                    "decision_selector",
                    Severity::Error,
                    "decision node must have at least one outgoing edge with a 'when' value",
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_parallel_fan_out(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes_of_type(NodeType::Parallel) {
        let edges: Vec<_> = graph.outgoing_edges(&node.id).collect();
        if edges.len() < 2 {
            diagnostics.push(
                Diagnostic::new(
                    "parallel_fan_out",
                    Severity::Error,
                    "parallel node must fan out to at least two branches",
                )
                .with_node_id(node.id.clone()),
            );
        }
        for edge in &edges {
            if edge
                .attrs
                .get_str("label")
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
            {
                diagnostics.push(
                    Diagnostic::new(
                        "parallel_fan_out",
                        Severity::Warning,
                        "parallel branch edge has no label; the target id will name the branch",
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_numeric_attrs(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if let Some(value) = graph.attrs.get("max_steps") {
        if !matches!(value, AttrValue::Integer(steps) if *steps > 0) {
            diagnostics.push(Diagnostic::new(
                "numeric_attrs",
                Severity::Error,
                "graph max_steps must be a positive integer",
            ));
        }
    }

    for node in graph.nodes.values() {
        if let Some(value) = node.attrs.get("retries") {
            if !matches!(value, AttrValue::Integer(retries) if *retries >= 0) {
                diagnostics.push(
                    Diagnostic::new(
                        "numeric_attrs",
                        Severity::Error,
                        "retries must be a non-negative integer",
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
        if let Some(value) = node.attrs.get("timeout_ms") {
            if value.as_millis().is_none() {
                diagnostics.push(
                    Diagnostic::new(
                        "numeric_attrs",
                        Severity::Error,
                        "timeout_ms must be a duration or non-negative integer",
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
        if let Some(value) = node.attrs.get("temperature") {
            let in_range = value
                .as_f64()
                .map(|temperature| (0.0..=2.0).contains(&temperature))
                .unwrap_or(false);
            if !in_range {
                diagnostics.push(
                    Diagnostic::new(
                        "numeric_attrs",
                        Severity::Error,
                        "temperature must be a number in 0..=2",
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
        if let Some(value) = node.attrs.get("max_tokens") {
            if !matches!(value, AttrValue::Integer(tokens) if *tokens >= 1) {
                diagnostics.push(
                    Diagnostic::new(
                        "numeric_attrs",
                        Severity::Error,
                        "max_tokens must be a positive integer",
                    )
                    .with_node_id(node.id.clone()),
                );
            }
        }
    }

    diagnostics
}

fn rule_stylesheet_syntax(graph: &Graph) -> Vec<Diagnostic> {
    let stylesheet = graph.attrs.get_str("model_stylesheet").unwrap_or_default();
    if stylesheet.trim().is_empty() {
        return Vec::new();
    }
    match parse_stylesheet(stylesheet) {
        Ok(_) => Vec::new(),
        Err(error) => vec![Diagnostic::new(
            "stylesheet_syntax",
            Severity::Error,
            error.to_string(),
        )],
    }
}

fn rule_known_type(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes
        .values()
        .filter_map(|node| {
            let declared = node.attrs.get_str("type")?;
            if NodeType::from_type_attr(declared).is_none() {
                Some(
                    Diagnostic::new(
                        "known_type",
                        Severity::Warning,
                        format!("unknown node type '{declared}'"),
                    )
                    .with_node_id(node.id.clone()),
                )
            } else {
                None
            }
        })
        .collect()
}

fn rule_model_prompt(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes_of_type(NodeType::Model)
        .into_iter()
        .filter(|node| {
            node.attrs.get_str("prompt").map(str::trim).unwrap_or_default().is_empty()
                && node.attrs.get_str("label").map(str::trim).unwrap_or_default().is_empty()
        })
        .map(|node| {
            Diagnostic::new(
                "model_prompt",
                Severity::Warning,
                "model node should define prompt or label",
            )
            .with_node_id(node.id.clone())
        })
        .collect()
}

fn rule_tool_named(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes_of_type(NodeType::Tool)
        .into_iter()
        .filter(|node| {
            node.attrs
                .get_str("tool")
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        })
        .map(|node| {
            Diagnostic::new(
                "tool_named",
                Severity::Error,
                "tool node must name the command to invoke via the 'tool' attribute",
            )
            .with_node_id(node.id.clone())
        })
        .collect()
}
