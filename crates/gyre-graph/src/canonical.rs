use crate::{AttrValue, Attributes, Graph, GraphError, parse};

/// Render the canonical DOT form of a graph.
///
/// The rendering is deterministic: nodes in identifier order, edges sorted by
/// `(from, to)` with their source order as tiebreak, attribute keys sorted.
/// Canonical text is a fixed point: parsing it and rendering again yields the
/// same bytes, which is what content digests are computed over.
pub fn canonicalize(graph: &Graph) -> String {
    let mut out = String::new();
    out.push_str("digraph ");
    out.push_str(&graph.id);
    out.push_str(" {\n");

    if !graph.attrs.is_empty() {
        out.push_str("  graph [");
        render_attrs(&mut out, &graph.attrs);
        out.push_str("]\n");
    }

    for node in graph.nodes.values() {
        out.push_str("  ");
        out.push_str(&node.id);
        if !node.attrs.is_empty() {
            out.push_str(" [");
            render_attrs(&mut out, &node.attrs);
            out.push(']');
        }
        out.push('\n');
    }

    let mut edges: Vec<_> = graph.edges.iter().collect();
    edges.sort_by(|left, right| {
        left.from
            .cmp(&right.from)
            .then_with(|| left.to.cmp(&right.to))
    });
    for edge in edges {
        out.push_str("  ");
        out.push_str(&edge.from);
        out.push_str(" -> ");
        out.push_str(&edge.to);
        if !edge.attrs.is_empty() {
            out.push_str(" [");
            render_attrs(&mut out, &edge.attrs);
            out.push(']');
        }
        out.push('\n');
    }

    out.push_str("}\n");
    out
}

/// Parse and re-render in one step; the form stored and digested by the
/// attractor store.
pub fn canonicalize_source(source: &str) -> Result<String, GraphError> {
    Ok(canonicalize(&parse(source)?))
}

fn render_attrs(out: &mut String, attrs: &Attributes) {
    let mut first = true;
    for (key, value) in attrs.values() {
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(key);
        out.push('=');
        render_value(out, value);
    }
}

fn render_value(out: &mut String, value: &AttrValue) {
    match value {
        AttrValue::String(text) => {
            out.push('"');
            for ch in text.chars() {
                match ch {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    other => out.push(other),
                }
            }
            out.push('"');
        }
        AttrValue::Integer(number) => out.push_str(&number.to_string()),
        AttrValue::Float(number) => {
            let rendered = number.to_string();
            out.push_str(&rendered);
            if !rendered.contains('.') {
                out.push_str(".0");
            }
        }
        AttrValue::Boolean(flag) => out.push_str(if *flag { "true" } else { "false" }),
        AttrValue::Duration(duration) => {
            out.push('"');
            out.push_str(&duration.raw);
            out.push('"');
        }
    }
}
