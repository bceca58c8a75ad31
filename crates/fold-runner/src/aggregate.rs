//! Joins experiment metadata, run records and flattened metrics into one
//! summary row per physical run, and gathers result files into typed
//! buckets.

use crate::document::DOCUMENT_COLUMN;
use crate::identity::{base_identifier, extract_base, job_identifier};
use crate::locate::{locate_results, JobResults, ResultKind};
use crate::metrics::{cell_text, read_affinity, read_confidence};
use anyhow::Result;
use fold_core::{atomic_copy, ensure_dir, read_table, write_table, Row, Table};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const BASE_NAME_COLUMN: &str = "base_name";
pub const RUN_FILENAME_COLUMN: &str = "filename";
pub const DEFAULT_SUMMARY_NAME: &str = "final_summary.csv";

const COLLISION_SUFFIX: &str = "_experiment";

/// Left join of run records onto experiment rows by base name. Every run
/// record yields exactly one row; runs without a matching experiment keep
/// only their own fields.
pub fn join_runs(experiments: &Table, runs: &Table) -> Result<Vec<Row>> {
    experiments.require_column("experiment", DOCUMENT_COLUMN)?;
    runs.require_column("run record", RUN_FILENAME_COLUMN)?;

    let mut by_base: BTreeMap<&str, &Row> = BTreeMap::new();
    for (idx, row) in experiments.rows.iter().enumerate() {
        let Some(file) = row.non_empty(DOCUMENT_COLUMN) else {
            warn!(row = idx + 1, "experiment row has no document name, cannot be joined");
            continue;
        };
        let base = base_identifier(file);
        if by_base.contains_key(base) {
            warn!(row = idx + 1, base, "duplicate experiment base name, keeping first row");
            continue;
        }
        by_base.insert(base, row);
    }

    let mut joined = Vec::with_capacity(runs.rows.len());
    for run in &runs.rows {
        let mut row = run.clone();
        let base = run.non_empty(RUN_FILENAME_COLUMN).map(extract_base);
        row.set(BASE_NAME_COLUMN, base.clone().unwrap_or_default());
        match base.as_deref().and_then(|b| by_base.get(b)) {
            Some(experiment) => {
                for (column, value) in experiment.iter() {
                    if row.contains(column) {
                        row.set(format!("{}{}", column, COLLISION_SUFFIX), value);
                    } else {
                        row.set(column, value);
                    }
                }
            }
            None => warn!(
                filename = run.get(RUN_FILENAME_COLUMN).unwrap_or(""),
                "run record has no matching experiment row"
            ),
        }
        joined.push(row);
    }
    Ok(joined)
}

/// Merges every confidence document (model-suffixed) and the affinity
/// document of a job into `row`.
pub fn merge_metrics(row: &mut Row, results: &JobResults) {
    for path in results.get(ResultKind::Confidence) {
        for (key, value) in read_confidence(path) {
            row.set(key, cell_text(&value));
        }
    }
    if let Some(path) = results.get(ResultKind::Affinity).first() {
        for (key, value) in read_affinity(path) {
            row.set(key, cell_text(&value));
        }
    }
}

/// Copies each result category of each job into its bucket under
/// `output_dir`. Returns the number of files copied.
pub fn collect_files(results: &BTreeMap<String, JobResults>, output_dir: &Path) -> Result<usize> {
    for kind in ResultKind::ALL {
        ensure_dir(&output_dir.join(kind.bucket()))?;
    }
    let mut copied = 0usize;
    for (job_id, job) in results {
        for kind in ResultKind::ALL {
            let bucket = output_dir.join(kind.bucket());
            for src in job.get(kind) {
                let Some(name) = src.file_name() else {
                    continue;
                };
                atomic_copy(src, &bucket.join(name))?;
                copied += 1;
            }
        }
        if job.folder.is_some() {
            info!(job = %job_id, "result files collected");
        }
    }
    Ok(copied)
}

pub struct AggregateResult {
    pub summary_path: PathBuf,
    pub summary: Table,
    pub jobs: usize,
    pub files_copied: usize,
}

pub fn aggregate(
    experiments_csv: &Path,
    runs_csv: &Path,
    predictions_dir: &Path,
    output_dir: &Path,
    summary_name: &str,
) -> Result<AggregateResult> {
    let experiments = read_table(experiments_csv)?;
    let runs = read_table(runs_csv)?;
    let joined = join_runs(&experiments, &runs)?;
    ensure_dir(output_dir)?;

    // Results are located once per job even though the join is per run.
    let mut results: BTreeMap<String, JobResults> = BTreeMap::new();
    let mut summary = Table::with_columns(runs.columns.iter().cloned());
    for (idx, mut row) in joined.into_iter().enumerate() {
        match row.non_empty(RUN_FILENAME_COLUMN).map(|f| job_identifier(f).to_string()) {
            Some(job_id) => {
                let job = results
                    .entry(job_id.clone())
                    .or_insert_with(|| locate_results(predictions_dir, &job_id));
                merge_metrics(&mut row, job);
            }
            None => warn!(row = idx + 1, "run record has no filename, keeping it without metrics"),
        }
        summary.push(row);
    }

    let files_copied = collect_files(&results, output_dir)?;
    let summary_path = output_dir.join(summary_name);
    write_table(&summary_path, &summary)?;
    info!(
        rows = summary.len(),
        jobs = results.len(),
        files = files_copied,
        summary = %summary_path.display(),
        "summary written"
    );
    Ok(AggregateResult {
        summary_path,
        summary,
        jobs: results.len(),
        files_copied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::write_documents;
    use crate::identity::replicate_file_name;
    use crate::locate::prediction_dir;
    use std::fs;
    use tempfile::TempDir;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        let mut t = Table::with_columns(columns.iter().copied());
        for cells in rows {
            t.push(columns.iter().copied().zip(cells.iter().copied()).collect());
        }
        t
    }

    #[test]
    fn join_keeps_every_run_record() {
        let experiments = table(
            &["foldname", "target", "yaml_file"],
            &[&["kinase", "EGFR", "kinase.yaml"], &["other", "BRAF", "other.yaml"]],
        );
        let runs = table(
            &["filename", "replicate", "processing_time_sec", "status"],
            &[
                &["kinase_rep1.yaml", "1", "10.5", "succeeded"],
                &["kinase_rep2.yaml", "2", "11", "failed"],
                &["orphan_rep1.yaml", "1", "3", "succeeded"],
            ],
        );
        let joined = join_runs(&experiments, &runs).expect("join");
        assert_eq!(joined.len(), 3);
        assert_eq!(joined[0].get("target"), Some("EGFR"));
        assert_eq!(joined[1].get("replicate"), Some("2"));
        assert_eq!(joined[1].get(BASE_NAME_COLUMN), Some("kinase"));
        assert_eq!(joined[2].get("target"), None);
        assert_eq!(joined[2].get(BASE_NAME_COLUMN), Some("orphan"));
    }

    #[test]
    fn colliding_experiment_columns_are_renamed() {
        let experiments = table(&["status", "yaml_file"], &[&["draft", "a.yaml"]]);
        let runs = table(&["filename", "status"], &[&["a_rep1.yaml", "succeeded"]]);
        let joined = join_runs(&experiments, &runs).expect("join");
        assert_eq!(joined[0].get("status"), Some("succeeded"));
        assert_eq!(joined[0].get("status_experiment"), Some("draft"));
    }

    #[test]
    fn duplicate_names_join_to_the_row_that_built_the_document() {
        let dir = TempDir::new().expect("tempdir");
        let input = dir.path().join("experiments.csv");
        fs::write(
            &input,
            "foldname,target,entity_1_type,entity_1_id,entity_1_sequence\n\
             job,FIRST,protein,A,AAAA\n\
             job,SECOND,protein,A,CCCC\n",
        )
        .expect("experiments");
        let docs = dir.path().join("yaml_out");
        let annotated = dir.path().join("yaml_output.csv");
        let written = write_documents(&input, &docs, &annotated).expect("documents");

        let mut runs = Table::with_columns(["filename"]);
        for path in &written.documents {
            let stem = path.file_stem().expect("stem").to_string_lossy().to_string();
            runs.push([("filename", replicate_file_name(&stem, 1, "yaml"))].into_iter().collect());
        }
        let experiments = read_table(&annotated).expect("annotated");
        let joined = join_runs(&experiments, &runs).expect("join");

        assert_eq!(joined.len(), 2);
        for row in &joined {
            let base = row.get(BASE_NAME_COLUMN).expect("base");
            let document = fs::read_to_string(docs.join(format!("{}.yaml", base))).expect("doc");
            match row.get("target") {
                Some("FIRST") => assert!(document.contains("sequence: AAAA"), "{}", document),
                Some("SECOND") => assert!(document.contains("sequence: CCCC"), "{}", document),
                other => panic!("unexpected target {:?}", other),
            }
        }
    }

    #[test]
    fn missing_identifying_columns_are_fatal() {
        let experiments = table(&["foldname"], &[&["a"]]);
        let runs = table(&["filename"], &[&["a_rep1.yaml"]]);
        let err = join_runs(&experiments, &runs).expect_err("missing yaml_file");
        assert!(err.to_string().contains("yaml_file"), "{}", err);

        let experiments = table(&["yaml_file"], &[&["a.yaml"]]);
        let runs = table(&["file"], &[&["a_rep1.yaml"]]);
        let err = join_runs(&experiments, &runs).expect_err("missing filename");
        assert!(err.to_string().contains("filename"), "{}", err);
    }

    #[test]
    fn aggregate_merges_metrics_and_buckets_files_once_per_job() {
        let dir = TempDir::new().expect("tempdir");
        let experiments_csv = dir.path().join("yaml_output.csv");
        fs::write(&experiments_csv, "foldname,yaml_file\nkinase,kinase.yaml\n").expect("experiments");
        let runs_csv = dir.path().join("run_records.csv");
        fs::write(
            &runs_csv,
            "filename,replicate,processing_time_sec,status\n\
             kinase_rep1.yaml,1,12.5,succeeded\n\
             kinase_rep2.yaml,2,40,timed_out\n\
             ,1,0,failed\n",
        )
        .expect("runs");

        let raw = dir.path().join("raw_out");
        let folder = prediction_dir(&raw, "kinase_rep1");
        fs::create_dir_all(&folder).expect("folder");
        fs::write(
            folder.join("confidence_kinase_rep1_model_0.json"),
            r#"{"ptm": 0.8, "chains_ptm": {"A": 0.9}, "pair_chains_iptm": {"A": {"B": 0.4}}}"#,
        )
        .expect("conf 0");
        fs::write(folder.join("confidence_kinase_rep1_model_1.json"), r#"{"ptm": 0.75}"#)
            .expect("conf 1");
        fs::write(folder.join("affinity_kinase_rep1.json"), r#"{"affinity_pred_value": -0.5}"#)
            .expect("affinity");
        fs::write(folder.join("kinase_rep1_model_0.cif"), "data_").expect("structure");

        let out = dir.path().join("final_out");
        let result = aggregate(&experiments_csv, &runs_csv, &raw, &out, DEFAULT_SUMMARY_NAME)
            .expect("aggregate");

        assert_eq!(result.summary.len(), 3);
        let first = &result.summary.rows[0];
        assert_eq!(first.get("foldname"), Some("kinase"));
        assert_eq!(first.get("ptm_model_0"), Some("0.8"));
        assert_eq!(first.get("ptm_model_1"), Some("0.75"));
        assert_eq!(first.get("chains_ptm_A_model_0"), Some("0.9"));
        assert_eq!(first.get("pair_chains_iptm_A_B_model_0"), Some("0.4"));
        assert_eq!(first.get("affinity_pred_value"), Some("-0.5"));

        let second = &result.summary.rows[1];
        assert_eq!(second.get("foldname"), Some("kinase"));
        assert_eq!(second.get("status"), Some("timed_out"));
        assert_eq!(second.get("ptm_model_0"), None);

        assert_eq!(result.jobs, 2);
        assert_eq!(result.files_copied, 4);
        for kind in ResultKind::ALL {
            assert!(out.join(kind.bucket()).is_dir(), "{}", kind.bucket());
        }
        assert!(out.join("final_pdbs").join("kinase_rep1_model_0.cif").is_file());
        assert!(out
            .join("final_confidence_json")
            .join("confidence_kinase_rep1_model_1.json")
            .is_file());

        let written = read_table(&result.summary_path).expect("summary csv");
        assert_eq!(written.len(), 3);
        assert!(written.has_column("affinity_pred_value"));
        assert_eq!(written.rows[1].get("affinity_pred_value"), Some(""));
    }
}
