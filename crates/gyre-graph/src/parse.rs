use crate::{AttrValue, Attributes, DurationValue, Edge, Graph, GraphError, Node, split_class_list};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Subgraph, Vertex,
};

/// Parse the attractor DOT subset into the internal graph form.
///
/// Only `digraph` is accepted; `strict`, undirected edges, HTML labels and
/// node ports are rejected. Unquoted duration literals (`timeout=900s`) are
/// quoted before the DOT grammar sees them.
pub fn parse(source: &str) -> Result<Graph, GraphError> {
    let mask = mask_strings_and_comments(source);
    if has_undirected_edge(source, &mask) {
        return Err(GraphError::Invalid(
            "undirected edge token '--' is not supported".to_string(),
        ));
    }

    let prepared = quote_duration_literals(source, &mask);
    let dot = graphviz_rust::parse(&prepared).map_err(GraphError::Parse)?;
    lower_graph(dot)
}

fn lower_graph(dot: DotGraph) -> Result<Graph, GraphError> {
    let (id, strict, directed, stmts) = match dot {
        DotGraph::DiGraph { id, strict, stmts } => (id, strict, true, stmts),
        DotGraph::Graph { id, strict, stmts } => (id, strict, false, stmts),
    };
    if !directed {
        return Err(GraphError::Invalid("only 'digraph' is supported".to_string()));
    }
    if strict {
        return Err(GraphError::Invalid(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let graph_id = match id {
        Id::Anonymous(value) => value,
        other => identifier(&other)?,
    };
    let mut graph = Graph::new(graph_id);
    lower_statements(&mut graph, &stmts, &Scope::default(), true)?;
    Ok(graph)
}

/// Defaults and subgraph classes that flow down into nested statements.
#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: Attributes,
    edge_defaults: Attributes,
    classes: Vec<String>,
}

fn lower_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent: &Scope,
    top_level: bool,
) -> Result<(), GraphError> {
    let mut scope = parent.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(GraphAttributes::Node(attrs)) => {
                scope.node_defaults.merge_inherited(&lower_attributes(attrs)?);
            }
            Stmt::GAttribute(GraphAttributes::Edge(attrs)) => {
                scope.edge_defaults.merge_inherited(&lower_attributes(attrs)?);
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                if top_level {
                    graph.attrs.merge_inherited(&lower_attributes(attrs)?);
                }
            }
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = lower_attribute(attr)?;
                    graph.attrs.set_explicit(key, value);
                }
            }
            Stmt::Node(node) => lower_node(graph, node, &scope)?,
            Stmt::Edge(edge) => lower_edge(graph, edge, &scope)?,
            Stmt::Subgraph(subgraph) => lower_subgraph(graph, subgraph, &scope)?,
        }
    }

    Ok(())
}

fn lower_subgraph(graph: &mut Graph, subgraph: &Subgraph, parent: &Scope) -> Result<(), GraphError> {
    let mut scope = parent.clone();
    if let Some(class) = subgraph_class(subgraph)? {
        scope.classes.push(class);
    }
    lower_statements(graph, &subgraph.stmts, &scope, false)
}

/// A labelled subgraph contributes its slugified label as a node class, so
/// stylesheet `.class` selectors can target whole clusters.
fn subgraph_class(subgraph: &Subgraph) -> Result<Option<String>, GraphError> {
    let mut label = None;
    for stmt in &subgraph.stmts {
        match stmt {
            Stmt::Attribute(Attribute(key, value)) => {
                if attr_key(key)? == "label" {
                    label = Some(id_text(value)?);
                }
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                for attr in attrs {
                    let (key, value) = lower_attribute(attr)?;
                    if key == "label" {
                        label = Some(value.to_string_value());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(label.as_deref().and_then(slugify))
}

fn slugify(label: &str) -> Option<String> {
    let mut out = String::new();
    for ch in label.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if (ch.is_ascii_whitespace() || ch == '-') && !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { None } else { Some(out) }
}

fn lower_node(graph: &mut Graph, node: &DotNode, scope: &Scope) -> Result<(), GraphError> {
    let node_id = node_identifier(&node.id)?;

    let mut attrs = scope.node_defaults.without_explicit();
    attrs.merge_with_explicit_tracking(&lower_attributes(&node.attributes)?);

    if !scope.classes.is_empty() {
        let mut classes = split_class_list(attrs.get_str("class").unwrap_or_default());
        for class in &scope.classes {
            if !classes.contains(class) {
                classes.push(class.clone());
            }
        }
        attrs.set_inherited("class", AttrValue::String(classes.join(",")));
    }

    let entry = graph
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| Node::new(node_id));
    entry.attrs.merge_with_explicit_tracking(&attrs);
    Ok(())
}

fn lower_edge(graph: &mut Graph, edge: &DotEdge, scope: &Scope) -> Result<(), GraphError> {
    let endpoints: Vec<String> = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![vertex_id(from)?, vertex_id(to)?],
        EdgeTy::Chain(chain) => chain
            .iter()
            .map(vertex_id)
            .collect::<Result<Vec<_>, _>>()?,
    };
    if endpoints.len() < 2 {
        return Err(GraphError::Invalid(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    let mut attrs = scope.edge_defaults.without_explicit();
    attrs.merge_with_explicit_tracking(&lower_attributes(&edge.attributes)?);

    for pair in endpoints.windows(2) {
        graph.edges.push(Edge {
            from: pair[0].clone(),
            to: pair[1].clone(),
            attrs: attrs.clone(),
        });
    }
    Ok(())
}

fn vertex_id(vertex: &Vertex) -> Result<String, GraphError> {
    match vertex {
        Vertex::N(node_id) => node_identifier(node_id),
        Vertex::S(_) => Err(GraphError::Invalid(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn node_identifier(node_id: &NodeId) -> Result<String, GraphError> {
    if node_id.1.is_some() {
        return Err(GraphError::Invalid(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    identifier(&node_id.0)
}

fn lower_attributes(attrs: &[Attribute]) -> Result<Attributes, GraphError> {
    let mut lowered = Attributes::new();
    for attr in attrs {
        let (key, value) = lower_attribute(attr)?;
        lowered.set_explicit(key, value);
    }
    Ok(lowered)
}

fn lower_attribute(attr: &Attribute) -> Result<(String, AttrValue), GraphError> {
    Ok((attr_key(&attr.0)?, attr_value(&attr.1)?))
}

fn attr_key(id: &Id) -> Result<String, GraphError> {
    let key = id_text(id)?;
    let valid = !key.is_empty()
        && key.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        });
    if valid {
        Ok(key)
    } else {
        Err(GraphError::Invalid(format!("invalid attribute key '{key}'")))
    }
}

fn attr_value(id: &Id) -> Result<AttrValue, GraphError> {
    match id {
        Id::Html(_) => Err(GraphError::Invalid(
            "HTML attribute values are not supported".to_string(),
        )),
        Id::Escaped(_) => {
            let text = id_text(id)?;
            Ok(match parse_duration(&text) {
                Some(duration) => AttrValue::Duration(duration),
                None => AttrValue::String(text),
            })
        }
        Id::Plain(raw) => Ok(classify_plain_value(raw)),
        Id::Anonymous(value) => Ok(AttrValue::String(value.clone())),
    }
}

fn classify_plain_value(raw: &str) -> AttrValue {
    if raw == "true" {
        return AttrValue::Boolean(true);
    }
    if raw == "false" {
        return AttrValue::Boolean(false);
    }
    if let Some(duration) = parse_duration(raw) {
        return AttrValue::Duration(duration);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return AttrValue::Integer(value);
    }
    if raw.contains('.') {
        if let Ok(value) = raw.parse::<f64>() {
            return AttrValue::Float(value);
        }
    }
    AttrValue::String(raw.to_string())
}

pub(crate) fn parse_duration(raw: &str) -> Option<DurationValue> {
    if raw.len() < 2 {
        return None;
    }
    let unit = ["ms", "s", "m", "h", "d"]
        .into_iter()
        .find(|unit| raw.ends_with(unit))?;
    let value = raw[..raw.len() - unit.len()].parse::<u64>().ok()?;
    let factor = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => unreachable!(),
    };
    Some(DurationValue {
        raw: raw.to_string(),
        millis: value.saturating_mul(factor),
    })
}

fn identifier(id: &Id) -> Result<String, GraphError> {
    let value = id_text(id)?;
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(value)
    } else {
        Err(GraphError::Invalid(format!(
            "node id '{value}' is invalid; expected [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

fn id_text(id: &Id) -> Result<String, GraphError> {
    match id {
        Id::Plain(value) | Id::Anonymous(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let inner = value
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
                .ok_or_else(|| {
                    GraphError::Invalid(format!("escaped string id '{value}' is missing quotes"))
                })?;
            Ok(unescape(inner))
        }
        Id::Html(_) => Err(GraphError::Invalid(
            "HTML labels/IDs are not supported".to_string(),
        )),
    }
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Per-byte mask marking positions inside quoted strings or comments, so the
/// raw-text passes never fire on literal content.
fn mask_strings_and_comments(source: &str) -> Vec<bool> {
    let bytes = source.as_bytes();
    let mut mask = vec![false; bytes.len()];
    let mut index = 0;

    #[derive(PartialEq)]
    enum Mode {
        Code,
        Str,
        LineComment,
        BlockComment,
    }
    let mut mode = Mode::Code;

    while index < bytes.len() {
        let current = bytes[index];
        let next = bytes.get(index + 1).copied();
        match mode {
            Mode::Code => match (current, next) {
                (b'"', _) => {
                    mask[index] = true;
                    mode = Mode::Str;
                }
                (b'/', Some(b'/')) => {
                    mask[index] = true;
                    mask[index + 1] = true;
                    mode = Mode::LineComment;
                    index += 1;
                }
                (b'/', Some(b'*')) => {
                    mask[index] = true;
                    mask[index + 1] = true;
                    mode = Mode::BlockComment;
                    index += 1;
                }
                _ => {}
            },
            Mode::Str => {
                mask[index] = true;
                if current == b'\\' {
                    if index + 1 < bytes.len() {
                        mask[index + 1] = true;
                        index += 1;
                    }
                } else if current == b'"' {
                    mode = Mode::Code;
                }
            }
            Mode::LineComment => {
                mask[index] = true;
                if current == b'\n' {
                    mode = Mode::Code;
                }
            }
            Mode::BlockComment => {
                mask[index] = true;
                if current == b'*' && next == Some(b'/') {
                    mask[index + 1] = true;
                    index += 1;
                    mode = Mode::Code;
                }
            }
        }
        index += 1;
    }

    mask
}

fn has_undirected_edge(source: &str, mask: &[bool]) -> bool {
    let bytes = source.as_bytes();
    bytes.windows(2).enumerate().any(|(index, window)| {
        window == b"--" && !mask[index] && !mask[index + 1]
    })
}

/// Quote bare duration tokens after `=` (e.g. `timeout=900s`) so the DOT
/// grammar accepts them; quoted values are left untouched.
fn quote_duration_literals(source: &str, mask: &[bool]) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len() + 16);
    let mut index = 0;

    while index < bytes.len() {
        let current = bytes[index] as char;
        out.push(current);
        index += 1;
        if current != '=' || mask[index - 1] {
            continue;
        }

        while index < bytes.len() && (bytes[index] as char).is_whitespace() {
            out.push(bytes[index] as char);
            index += 1;
        }
        let token_start = index;
        while index < bytes.len()
            && !mask[index]
            && (bytes[index] as char).is_ascii_alphanumeric()
        {
            index += 1;
        }
        if token_start == index {
            continue;
        }
        let token = &source[token_start..index];
        if parse_duration(token).is_some() {
            out.push('"');
            out.push_str(token);
            out.push('"');
        } else {
            out.push_str(token);
        }
    }

    out
}
