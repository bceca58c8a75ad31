use crate::identity::{is_document, replicate_file_name};
use anyhow::{anyhow, Result};
use fold_core::{atomic_copy, ensure_dir};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const REPLICATES_DIR: &str = "replicates";

/// Job documents directly inside `dir`, sorted by filename.
pub fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut documents = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.file_type().is_file() && is_document(entry.path()) {
            documents.push(entry.into_path());
        }
    }
    Ok(documents)
}

/// Copies every document in `input_dir` `num_replicates` times into
/// `input_dir/replicates/` as `<base>_rep<k>.<ext>`. The directory is
/// created and populated even for a single replicate so downstream naming
/// never depends on the replication factor.
pub fn replicate_documents(input_dir: &Path, num_replicates: u32) -> Result<PathBuf> {
    if num_replicates == 0 {
        return Err(anyhow!("num_replicates must be at least 1"));
    }
    if !input_dir.is_dir() {
        return Err(anyhow!(
            "input directory not found: {}",
            input_dir.display()
        ));
    }
    let replicates_dir = input_dir.join(REPLICATES_DIR);
    ensure_dir(&replicates_dir)?;

    let sources = list_documents(input_dir)?;
    for source in &sources {
        let (base, ext) = match (
            source.file_stem().and_then(|s| s.to_str()),
            source.extension().and_then(|s| s.to_str()),
        ) {
            (Some(base), Some(ext)) => (base, ext),
            _ => continue,
        };
        for rep in 1..=num_replicates {
            let target = replicates_dir.join(replicate_file_name(base, rep, ext));
            atomic_copy(source, &target)?;
            debug!(source = %source.display(), target = %target.display(), "replicate written");
        }
    }
    info!(
        documents = sources.len(),
        replicates = num_replicates,
        dir = %replicates_dir.display(),
        "replicate documents created"
    );
    Ok(replicates_dir)
}
