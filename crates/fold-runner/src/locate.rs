//! Where the prediction tool leaves its outputs for a job, and which files
//! belong to which category.

use glob::{glob, Pattern};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const RESULTS_DIR_PREFIX: &str = "boltz_results_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResultKind {
    Structure,
    Pae,
    Plddt,
    Confidence,
    Affinity,
    PreAffinity,
    Pde,
}

impl ResultKind {
    pub const ALL: [ResultKind; 7] = [
        ResultKind::Structure,
        ResultKind::Pae,
        ResultKind::Plddt,
        ResultKind::Confidence,
        ResultKind::Affinity,
        ResultKind::PreAffinity,
        ResultKind::Pde,
    ];

    /// Destination bucket under the aggregation output directory.
    pub fn bucket(&self) -> &'static str {
        match self {
            ResultKind::Structure => "final_pdbs",
            ResultKind::Pae => "final_pae",
            ResultKind::Plddt => "final_plddt",
            ResultKind::Confidence => "final_confidence_json",
            ResultKind::Affinity => "final_affinity_json",
            ResultKind::PreAffinity => "final_pre_affinity",
            ResultKind::Pde => "final_pde",
        }
    }

    /// File name patterns for `job_id`, with the id already glob-escaped.
    pub fn patterns(&self, job_id: &str) -> Vec<String> {
        let id = Pattern::escape(job_id);
        match self {
            ResultKind::Structure => vec![
                format!("{}_model_*.pdb", id),
                format!("{}_model_*.cif", id),
            ],
            ResultKind::Pae => vec![format!("pae_{}_model_*.npz", id)],
            ResultKind::Plddt => vec![format!("plddt_{}_model_*.npz", id)],
            ResultKind::Confidence => vec![format!("confidence_{}_model_*.json", id)],
            ResultKind::Affinity => vec![format!("affinity_{}.json", id)],
            ResultKind::PreAffinity => vec![format!("pre_affinity_{}.npz", id)],
            ResultKind::Pde => vec![format!("pde_{}_model_*.npz", id)],
        }
    }

    /// Categories every finished job is expected to produce; the others
    /// depend on the job's properties and tool flags.
    fn expected(&self) -> bool {
        matches!(
            self,
            ResultKind::Structure | ResultKind::Pae | ResultKind::Confidence | ResultKind::Affinity
        )
    }
}

pub fn prediction_dir(predictions_root: &Path, job_id: &str) -> PathBuf {
    predictions_root
        .join(format!("{}{}", RESULTS_DIR_PREFIX, job_id))
        .join("predictions")
        .join(job_id)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobResults {
    pub folder: Option<PathBuf>,
    pub files: BTreeMap<ResultKind, Vec<PathBuf>>,
}

impl JobResults {
    pub fn get(&self, kind: ResultKind) -> &[PathBuf] {
        self.files.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Files of one category inside `folder`, sorted. Unreadable entries are
/// skipped.
pub fn find_results(folder: &Path, job_id: &str, kind: ResultKind) -> Vec<PathBuf> {
    let base = Pattern::escape(&folder.to_string_lossy());
    let mut found = Vec::new();
    for pattern in kind.patterns(job_id) {
        let full = format!("{}/{}", base, pattern);
        match glob(&full) {
            Ok(paths) => found.extend(paths.filter_map(|p| p.ok()).filter(|p| p.is_file())),
            Err(err) => warn!(pattern = %full, error = %err, "invalid result pattern"),
        }
    }
    found.sort();
    found
}

/// Enumerates every result category for a job. A missing folder yields no
/// files at all; each missing category is reported and left empty.
pub fn locate_results(predictions_root: &Path, job_id: &str) -> JobResults {
    let folder = prediction_dir(predictions_root, job_id);
    if !folder.is_dir() {
        warn!(job = job_id, folder = %folder.display(), "predictions folder not found");
        return JobResults::default();
    }
    let mut files = BTreeMap::new();
    for kind in ResultKind::ALL {
        let found = find_results(&folder, job_id, kind);
        if found.is_empty() {
            if kind.expected() {
                warn!(job = job_id, category = kind.bucket(), "no result files found");
            } else {
                debug!(job = job_id, category = kind.bucket(), "no result files found");
            }
        }
        files.insert(kind, found);
    }
    JobResults {
        folder: Some(folder),
        files,
    }
}
