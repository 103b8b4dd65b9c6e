use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationValue {
    pub raw: String,
    pub millis: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(DurationValue),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Milliseconds for duration values, or a plain integer read as millis.
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Self::Duration(value) => Some(value.millis),
            Self::Integer(value) if *value >= 0 => Some(*value as u64),
            _ => None,
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Duration(value) => value.raw.clone(),
        }
    }
}

/// Attribute bag attached to graphs, nodes, and edges.
///
/// Keys set directly on an element are tracked as explicit so that the
/// stylesheet overlay never clobbers an author-written value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
    explicit_keys: BTreeSet<String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set_inherited(&mut self, key: impl Into<String>, value: AttrValue) {
        self.values.insert(key.into(), value);
    }

    pub fn set_explicit(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        self.explicit_keys.insert(key.clone());
        self.values.insert(key, value);
    }

    pub fn merge_inherited(&mut self, other: &Attributes) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_with_explicit_tracking(&mut self, other: &Attributes) {
        for (key, value) in &other.values {
            if other.explicit_keys.contains(key) {
                self.explicit_keys.insert(key.clone());
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }

    pub fn is_explicit(&self, key: &str) -> bool {
        self.explicit_keys.contains(key)
    }

    pub fn without_explicit(&self) -> Self {
        Self {
            values: self.values.clone(),
            explicit_keys: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolved node kind. Explicit `type` wins; otherwise the DOT shape maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Start,
    Terminal,
    Model,
    Tool,
    Human,
    Parallel,
    Decision,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Terminal => "terminal",
            Self::Model => "model",
            Self::Tool => "tool",
            Self::Human => "human",
            Self::Parallel => "parallel",
            Self::Decision => "decision",
        }
    }

    pub fn from_type_attr(value: &str) -> Option<Self> {
        match value.trim() {
            "start" => Some(Self::Start),
            "terminal" => Some(Self::Terminal),
            "model" => Some(Self::Model),
            "tool" => Some(Self::Tool),
            "human" => Some(Self::Human),
            "parallel" => Some(Self::Parallel),
            "decision" => Some(Self::Decision),
            _ => None,
        }
    }

    pub fn from_shape(shape: &str) -> Option<Self> {
        match shape.trim() {
            "Mdiamond" => Some(Self::Start),
            "Msquare" => Some(Self::Terminal),
            "box" => Some(Self::Model),
            "parallelogram" => Some(Self::Tool),
            "hexagon" => Some(Self::Human),
            "component" => Some(Self::Parallel),
            "diamond" => Some(Self::Decision),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub attrs: Attributes,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
        }
    }

    /// Node kind with `type` attribute precedence over the shape mapping.
    /// Nodes named `start` or `exit`/`end` keep their conventional role even
    /// without a shape.
    pub fn node_type(&self) -> NodeType {
        if let Some(explicit) = self
            .attrs
            .get_str("type")
            .and_then(NodeType::from_type_attr)
        {
            return explicit;
        }
        if let Some(shaped) = self
            .attrs
            .get_str("shape")
            .and_then(NodeType::from_shape)
        {
            return shaped;
        }
        match self.id.to_ascii_lowercase().as_str() {
            "start" => NodeType::Start,
            "exit" | "end" => NodeType::Terminal,
            _ => NodeType::Model,
        }
    }

    pub fn classes(&self) -> Vec<String> {
        split_class_list(self.attrs.get_str("class").unwrap_or_default())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attributes,
}

impl Edge {
    /// Branch label used by parallel fan-out and human gates; the target id
    /// stands in when no label is written.
    pub fn branch_label(&self) -> &str {
        self.attrs
            .get_str("label")
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .unwrap_or(self.to.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.node_type() == node_type)
            .collect()
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes_of_type(NodeType::Start).into_iter().next()
    }

    /// Graph-level step ceiling; runs fail when it is exhausted.
    pub fn max_steps(&self) -> u64 {
        self.attrs
            .get_i64("max_steps")
            .filter(|value| *value > 0)
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_MAX_STEPS)
    }
}

pub const DEFAULT_MAX_STEPS: u64 = 100;

pub fn split_class_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_resolution_type_attr_beats_shape() {
        let mut node = Node::new("gate");
        node.attrs
            .set_explicit("shape", AttrValue::String("box".to_string()));
        node.attrs
            .set_explicit("type", AttrValue::String("decision".to_string()));
        assert_eq!(node.node_type(), NodeType::Decision);
    }

    #[test]
    fn node_type_resolution_conventional_ids() {
        assert_eq!(Node::new("start").node_type(), NodeType::Start);
        assert_eq!(Node::new("exit").node_type(), NodeType::Terminal);
        assert_eq!(Node::new("review").node_type(), NodeType::Model);
    }

    #[test]
    fn branch_label_falls_back_to_target_id() {
        let edge = Edge {
            from: "fan".to_string(),
            to: "lint".to_string(),
            attrs: Attributes::new(),
        };
        assert_eq!(edge.branch_label(), "lint");
    }

    #[test]
    fn attributes_explicit_tracking_survives_merge() {
        let mut defaults = Attributes::new();
        defaults.set_inherited("timeout_ms", AttrValue::Integer(1000));
        let mut own = Attributes::new();
        own.set_explicit("prompt", AttrValue::String("do it".to_string()));

        let mut merged = defaults.without_explicit();
        merged.merge_with_explicit_tracking(&own);
        assert!(merged.is_explicit("prompt"));
        assert!(!merged.is_explicit("timeout_ms"));
    }

    #[test]
    fn max_steps_defaults_and_reads_graph_attr() {
        let mut graph = Graph::new("g");
        assert_eq!(graph.max_steps(), DEFAULT_MAX_STEPS);
        graph.attrs.set_explicit("max_steps", AttrValue::Integer(7));
        assert_eq!(graph.max_steps(), 7);
    }
}
