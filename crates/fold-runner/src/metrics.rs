//! Flattening of per-model confidence documents and per-job affinity
//! documents into single-level metric maps.

use regex::Regex;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

pub type Metrics = Map<String, Value>;

pub const CONFIDENCE_SCALARS: [&str; 9] = [
    "confidence_score",
    "ptm",
    "iptm",
    "ligand_iptm",
    "protein_iptm",
    "complex_plddt",
    "complex_iplddt",
    "complex_pde",
    "complex_ipde",
];

pub const UNKNOWN_MODEL_INDEX: &str = "?";

fn model_index_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_model_(\d+)\.json$").expect("valid model index pattern"))
}

/// Model index encoded in a confidence filename, `?` when absent.
pub fn model_index(file_name: &str) -> String {
    model_index_pattern()
        .captures(file_name)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| UNKNOWN_MODEL_INDEX.to_string())
}

/// Allow-listed scalars plus `chains_ptm_<chain>` and
/// `pair_chains_iptm_<i>_<j>`, before model suffixing.
pub fn flatten_confidence(doc: &Value) -> Metrics {
    let mut metrics = Metrics::new();
    for key in CONFIDENCE_SCALARS {
        if let Some(value) = doc.get(key) {
            metrics.insert(key.to_string(), value.clone());
        }
    }
    if let Some(chains) = doc.get("chains_ptm").and_then(Value::as_object) {
        for (chain, value) in chains {
            metrics.insert(format!("chains_ptm_{}", chain), value.clone());
        }
    }
    if let Some(pairs) = doc.get("pair_chains_iptm").and_then(Value::as_object) {
        for (chain_i, inner) in pairs {
            let Some(inner) = inner.as_object() else {
                continue;
            };
            for (chain_j, value) in inner {
                metrics.insert(format!("pair_chains_iptm_{}_{}", chain_i, chain_j), value.clone());
            }
        }
    }
    metrics
}

pub fn suffix_model(metrics: Metrics, index: &str) -> Metrics {
    metrics
        .into_iter()
        .map(|(key, value)| (format!("{}_model_{}", key, index), value))
        .collect()
}

fn read_json(path: &Path) -> Option<Value> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read metrics document");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not parse metrics document");
            None
        }
    }
}

/// Flattened, model-suffixed metrics of one confidence document. Unreadable
/// documents contribute nothing.
pub fn read_confidence(path: &Path) -> Metrics {
    let index = path
        .file_name()
        .map(|n| model_index(&n.to_string_lossy()))
        .unwrap_or_else(|| UNKNOWN_MODEL_INDEX.to_string());
    match read_json(path) {
        Some(doc) => suffix_model(flatten_confidence(&doc), &index),
        None => Metrics::new(),
    }
}

/// Affinity metrics are per job, so they are copied as-is.
pub fn read_affinity(path: &Path) -> Metrics {
    match read_json(path) {
        Some(Value::Object(map)) => map,
        Some(_) => {
            warn!(path = %path.display(), "affinity document is not a JSON object");
            Metrics::new()
        }
        None => Metrics::new(),
    }
}

/// Renders a metric for a table cell: strings bare, null empty, everything
/// else as JSON text.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
