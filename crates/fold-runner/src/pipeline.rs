use crate::aggregate::{aggregate, AggregateResult};
use crate::document::{write_documents, WriteDocumentsResult};
use crate::runner::{run_batch, BatchResult, RunConfig};
use anyhow::Result;
use fold_core::ensure_dir;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DOCUMENTS_DIR: &str = "yaml_out";
pub const EXPERIMENT_TABLE_FILE: &str = "yaml_output.csv";
pub const PREDICTIONS_DIR: &str = "raw_out";
pub const FINAL_DIR: &str = "final_out";

/// Directory layout of one end-to-end pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineLayout {
    pub documents_dir: PathBuf,
    pub experiment_table: PathBuf,
    pub predictions_dir: PathBuf,
    pub final_dir: PathBuf,
}

impl PipelineLayout {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            documents_dir: output_dir.join(DOCUMENTS_DIR),
            experiment_table: output_dir.join(EXPERIMENT_TABLE_FILE),
            predictions_dir: output_dir.join(PREDICTIONS_DIR),
            final_dir: output_dir.join(FINAL_DIR),
        }
    }
}

pub struct PipelineResult {
    pub layout: PipelineLayout,
    pub documents: WriteDocumentsResult,
    pub batch: BatchResult,
    pub aggregate: AggregateResult,
}

/// Experiment table in, summary table out: encode, replicate and run, then
/// aggregate. Individual job failures are recorded, never fatal.
pub fn run_pipeline(
    input_csv: &Path,
    output_dir: &Path,
    config: &RunConfig,
    summary_name: &str,
) -> Result<PipelineResult> {
    ensure_dir(output_dir)?;
    let layout = PipelineLayout::new(output_dir);

    let documents = write_documents(input_csv, &layout.documents_dir, &layout.experiment_table)?;
    let batch = run_batch(&layout.documents_dir, &layout.predictions_dir, config)?;
    let aggregate = aggregate(
        &layout.experiment_table,
        &batch.records_path,
        &layout.predictions_dir,
        &layout.final_dir,
        summary_name,
    )?;
    info!(
        documents = documents.documents.len(),
        runs = batch.records.len(),
        summary = %aggregate.summary_path.display(),
        "pipeline finished"
    );
    Ok(PipelineResult {
        layout,
        documents,
        batch,
        aggregate,
    })
}
