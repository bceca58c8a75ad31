//! Deterministic block-style YAML emitter for job documents.
//!
//! `serde_yaml` has no per-node style control, so the tree is laid out here
//! and only scalar quoting is delegated to it. Output follows the layout the
//! prediction tool's own examples use: two-space indents, sequences flush
//! with their parent key, inline lists for multi-chain ids and single-quoted
//! SMILES.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Scalar(Value),
    SingleQuoted(String),
    Flow(Vec<Value>),
    Seq(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    pub(crate) fn str(value: impl Into<String>) -> Self {
        Node::Scalar(Value::String(value.into()))
    }

    fn is_inline(&self) -> bool {
        match self {
            Node::Scalar(_) | Node::SingleQuoted(_) | Node::Flow(_) => true,
            Node::Seq(items) => items.is_empty(),
            Node::Map(entries) => entries.is_empty(),
        }
    }
}

impl From<&Value> for Node {
    fn from(value: &Value) -> Self {
        match value {
            Value::Array(items) => Node::Seq(items.iter().map(Node::from).collect()),
            Value::Object(map) => Node::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Node::from(v)))
                    .collect(),
            ),
            scalar => Node::Scalar(scalar.clone()),
        }
    }
}

pub(crate) fn to_string(root: &Node) -> String {
    let mut out = String::new();
    match root {
        Node::Map(entries) if !entries.is_empty() => write_map(&mut out, entries, 0),
        Node::Seq(items) if !items.is_empty() => write_seq(&mut out, items, 0),
        other => {
            out.push_str(&inline(other));
            out.push('\n');
        }
    }
    out
}

fn write_map(out: &mut String, entries: &[(String, Node)], indent: usize) {
    for (key, value) in entries {
        out.push_str(&" ".repeat(indent));
        out.push_str(&render_scalar(&Value::String(key.clone())));
        out.push(':');
        match value {
            v if v.is_inline() => {
                out.push(' ');
                out.push_str(&inline(v));
                out.push('\n');
            }
            Node::Map(inner) => {
                out.push('\n');
                write_map(out, inner, indent + 2);
            }
            Node::Seq(items) => {
                out.push('\n');
                write_seq(out, items, indent);
            }
            _ => {}
        }
    }
}

fn write_seq(out: &mut String, items: &[Node], indent: usize) {
    let pad = " ".repeat(indent);
    for item in items {
        if item.is_inline() {
            out.push_str(&pad);
            out.push_str("- ");
            out.push_str(&inline(item));
            out.push('\n');
            continue;
        }
        // Lay the nested block out one level deeper, then fold its first
        // line onto the dash.
        let mut nested = String::new();
        match item {
            Node::Map(entries) => write_map(&mut nested, entries, indent + 2),
            Node::Seq(inner) => write_seq(&mut nested, inner, indent + 2),
            _ => {}
        }
        out.push_str(&pad);
        out.push_str("- ");
        out.push_str(&nested[indent + 2..]);
    }
}

fn inline(node: &Node) -> String {
    match node {
        Node::Scalar(value) => render_scalar(value),
        Node::SingleQuoted(s) => format!("'{}'", s.replace('\'', "''")),
        Node::Flow(items) => format!(
            "[{}]",
            items
                .iter()
                .map(render_flow_item)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Node::Seq(_) => "[]".to_string(),
        Node::Map(_) => "{}".to_string(),
    }
}

/// Flow items additionally must not carry flow indicators unquoted.
fn render_flow_item(value: &Value) -> String {
    let rendered = render_scalar(value);
    let quoted = rendered.starts_with('\'') || rendered.starts_with('"');
    if !quoted && rendered.contains(|c| matches!(c, ',' | '[' | ']' | '{' | '}' | '#')) {
        return value.to_string();
    }
    rendered
}

fn render_scalar(value: &Value) -> String {
    let rendered = serde_yaml::to_string(value)
        .map(|s| s.trim_end_matches('\n').to_string())
        .unwrap_or_default();
    if rendered.is_empty() || rendered.contains('\n') {
        // JSON strings are valid double-quoted YAML scalars.
        return value.to_string();
    }
    rendered
}
