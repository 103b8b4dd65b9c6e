use crate::{AttrValue, Graph, GraphError};

/// Properties the model stylesheet may set on nodes.
const STYLESHEET_PROPERTIES: [&str; 3] = ["provider", "model", "reasoning"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Universal,
    NodeId(String),
    Class(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StylesheetRule {
    pub selector: Selector,
    pub declarations: Vec<(String, String)>,
    pub order: usize,
}

impl StylesheetRule {
    fn specificity(&self) -> usize {
        match self.selector {
            Selector::Universal => 0,
            Selector::Class(_) => 1,
            Selector::NodeId(_) => 2,
        }
    }

    fn matches(&self, node_id: &str, classes: &[String]) -> bool {
        match &self.selector {
            Selector::Universal => true,
            Selector::NodeId(id) => id == node_id,
            Selector::Class(class) => classes.iter().any(|candidate| candidate == class),
        }
    }
}

pub fn parse_stylesheet(input: &str) -> Result<Vec<StylesheetRule>, GraphError> {
    let mut rules = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let brace = rest.find('{').ok_or_else(|| {
            GraphError::Stylesheet("missing '{' after selector".to_string())
        })?;
        let selector = parse_selector(rest[..brace].trim())?;
        rest = &rest[brace + 1..];

        let close = rest.find('}').ok_or_else(|| {
            GraphError::Stylesheet("missing closing '}' for stylesheet rule".to_string())
        })?;
        let declarations = parse_declarations(&rest[..close])?;
        rest = rest[close + 1..].trim_start();

        rules.push(StylesheetRule {
            selector,
            declarations,
            order: rules.len(),
        });
    }

    Ok(rules)
}

/// Overlay `model_stylesheet` declarations onto node attributes.
///
/// Runs before validation. Explicit node attributes always win; among
/// matching rules the most specific selector wins, source order breaking
/// ties.
pub fn apply_model_stylesheet(graph: &mut Graph) -> Result<(), GraphError> {
    let stylesheet = graph.attrs.get_str("model_stylesheet").unwrap_or_default();
    if stylesheet.trim().is_empty() {
        return Ok(());
    }
    let rules = parse_stylesheet(stylesheet)?;

    for node in graph.nodes.values_mut() {
        let classes = node.classes();
        for property in STYLESHEET_PROPERTIES {
            if node.attrs.is_explicit(property) {
                continue;
            }

            let winner = rules
                .iter()
                .filter(|rule| rule.matches(&node.id, &classes))
                .filter_map(|rule| {
                    rule.declarations
                        .iter()
                        .find(|(key, _)| key == property)
                        .map(|(_, value)| (rule.specificity(), rule.order, value))
                })
                .max_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.cmp(&right.1)));

            if let Some((_, _, value)) = winner {
                node.attrs
                    .set_inherited(property, AttrValue::String(value.clone()));
            }
        }
    }

    Ok(())
}

fn parse_selector(raw: &str) -> Result<Selector, GraphError> {
    if raw.is_empty() {
        return Err(GraphError::Stylesheet("empty selector is invalid".to_string()));
    }
    if raw == "*" {
        return Ok(Selector::Universal);
    }
    if let Some(id) = raw.strip_prefix('#') {
        if !is_identifier(id) {
            return Err(GraphError::Stylesheet(format!(
                "invalid node id selector '#{id}'"
            )));
        }
        return Ok(Selector::NodeId(id.to_string()));
    }
    if let Some(class) = raw.strip_prefix('.') {
        let valid = !class.is_empty()
            && class
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
        if !valid {
            return Err(GraphError::Stylesheet(format!(
                "invalid class selector '.{class}'"
            )));
        }
        return Ok(Selector::Class(class.to_string()));
    }
    Err(GraphError::Stylesheet(format!("unsupported selector '{raw}'")))
}

fn parse_declarations(block: &str) -> Result<Vec<(String, String)>, GraphError> {
    let mut declarations = Vec::new();

    for declaration in block.split(';') {
        let declaration = declaration.trim();
        if declaration.is_empty() {
            continue;
        }
        let (property, value) = declaration.split_once(':').ok_or_else(|| {
            GraphError::Stylesheet(format!("declaration '{declaration}' is missing ':'"))
        })?;
        let property = property.trim();
        let value = value.trim();

        if !STYLESHEET_PROPERTIES.contains(&property) {
            return Err(GraphError::Stylesheet(format!(
                "property '{property}' is not supported"
            )));
        }
        if value.is_empty() {
            return Err(GraphError::Stylesheet(format!(
                "property '{property}' must have a non-empty value"
            )));
        }

        let unquoted = if value.starts_with('"') {
            value
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
                .ok_or_else(|| {
                    GraphError::Stylesheet(format!("value '{value}' has unmatched quotes"))
                })?
                .to_string()
        } else {
            value.to_string()
        };

        if property == "reasoning" && !matches!(unquoted.as_str(), "low" | "medium" | "high") {
            return Err(GraphError::Stylesheet(format!(
                "reasoning '{unquoted}' must be low|medium|high"
            )));
        }

        declarations.push((property.to_string(), unquoted));
    }

    if declarations.is_empty() {
        return Err(GraphError::Stylesheet(
            "stylesheet rule must contain at least one declaration".to_string(),
        ));
    }
    Ok(declarations)
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
