//! Job naming: base identifiers, replicate suffixes and job ids.
//!
//! Two derivations of a base name coexist. Documents listed in the
//! experiment table are matched with [`base_identifier`], a plain strip of
//! the document extension, while run-record filenames go through
//! [`extract_base`], which recognises the `_rep<k>` suffix and otherwise
//! drops the last `.`-segment. Joins rely on both agreeing for unreplicated
//! names.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub const DOCUMENT_EXTENSIONS: [&str; 2] = ["yaml", "yml"];
pub const DEFAULT_EXTENSION: &str = "yaml";

fn replicate_file_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*)_rep\d+\.ya?ml$").expect("valid replicate file pattern"))
}

fn replicate_suffix_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"_rep(\d+)(?:\.[^._]+)?$").expect("valid replicate suffix pattern")
    })
}

pub fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| DOCUMENT_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Strips exactly one document extension; other names pass through.
pub fn base_identifier(file_name: &str) -> &str {
    DOCUMENT_EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(&format!(".{}", ext)))
        .unwrap_or(file_name)
}

pub fn extract_base(file_name: &str) -> String {
    if let Some(caps) = replicate_file_pattern().captures(file_name) {
        return caps[1].to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => file_name.to_string(),
    }
}

/// Replicate number carried by the trailing `_rep<k>` suffix, 1 for
/// unreplicated names. Earlier `_rep<k>` runs belong to the base name.
pub fn replicate_number(file_name: &str) -> u32 {
    replicate_suffix_pattern()
        .captures(file_name)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(1)
}

pub fn replicate_file_name(base: &str, replicate: u32, extension: &str) -> String {
    format!("{}_rep{}.{}", base, replicate, extension)
}

/// Identifier the prediction tool names its outputs after: the replicate
/// document's filename without its extension.
pub fn job_identifier(file_name: &str) -> &str {
    base_identifier(file_name)
}
