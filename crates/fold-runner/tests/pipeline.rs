#![cfg(unix)]

use fold_core::read_table;
use fold_runner::{run_pipeline, PredictOptions, RunConfig, DEFAULT_SUMMARY_NAME};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Stands in for the prediction tool: writes the tool's output layout for
/// the document named by the last argument.
const FAKE_TOOL: &str = r#"
out=""; prev=""
for a; do
  if [ "$prev" = "--out_dir" ]; then out="$a"; fi
  prev="$a"; last="$a"
done
stem=$(basename "$last"); stem="${stem%.yaml}"
dir="$out/boltz_results_$stem/predictions/$stem"
mkdir -p "$dir"
printf '{"ptm": 0.8, "iptm": 0.6, "chains_ptm": {"A": 0.9}}' > "$dir/confidence_${stem}_model_0.json"
printf 'data_%s\n' "$stem" > "$dir/${stem}_model_0.cif"
case "$stem" in
  binder_*) printf '{"affinity_pred_value": -1.5}' > "$dir/affinity_${stem}.json" ;;
esac
"#;

fn fake_config(num_replicates: u32) -> RunConfig {
    RunConfig {
        num_replicates,
        max_time_minutes: Some(1.0),
        predict: PredictOptions {
            program: vec![
                "sh".to_string(),
                "-c".to_string(),
                FAKE_TOOL.to_string(),
                "fake-fold".to_string(),
            ],
            ..PredictOptions::default()
        },
    }
}

fn write_experiments(path: &Path) {
    fs::write(
        path,
        "foldname,target,entity_1_type,entity_1_id,entity_1_sequence,entity_2_type,entity_2_id,entity_2_smiles,affinity_binder\n\
         kinase,EGFR,protein,A,MKTAYIAKQR,,,,\n\
         binder,BRAF,protein,A,MVLSPADKTN,ligand,B,CC(=O)O,B\n",
    )
    .expect("experiments");
}

#[test]
fn pipeline_produces_one_summary_row_per_replicate() {
    let dir = TempDir::new().expect("tempdir");
    let input = dir.path().join("experiments.csv");
    write_experiments(&input);
    let out = dir.path().join("out");

    let result = run_pipeline(&input, &out, &fake_config(2), DEFAULT_SUMMARY_NAME).expect("pipeline");

    assert_eq!(result.documents.documents.len(), 2);
    assert!(out.join("yaml_out").join("kinase.yaml").is_file());
    let binder_doc = fs::read_to_string(out.join("yaml_out").join("binder.yaml")).expect("doc");
    let parsed: serde_yaml::Value = serde_yaml::from_str(&binder_doc).expect("yaml");
    assert_eq!(parsed["sequences"][1]["ligand"]["smiles"].as_str(), Some("CC(=O)O"));
    assert_eq!(parsed["properties"][0]["affinity"]["binder"].as_str(), Some("B"));

    assert_eq!(result.batch.records.len(), 4);
    assert!(result.batch.records.iter().all(|r| r.outcome.as_str() == "succeeded"));
    let runs = read_table(&out.join("raw_out").join("run_records.csv")).expect("run records");
    assert_eq!(runs.len(), 4);

    let summary = read_table(&out.join("final_out").join(DEFAULT_SUMMARY_NAME)).expect("summary");
    assert_eq!(summary.len(), 4);
    for row in &summary.rows {
        let filename = row.get("filename").expect("filename");
        let base = row.get("base_name").expect("base name");
        assert!(filename.starts_with(base), "{} / {}", filename, base);
        assert_eq!(row.get("ptm_model_0"), Some("0.8"));
        assert_eq!(row.get("chains_ptm_A_model_0"), Some("0.9"));
        assert_eq!(row.get("status"), Some("succeeded"));
        match base {
            "kinase" => {
                assert_eq!(row.get("target"), Some("EGFR"));
                assert_eq!(row.get("affinity_pred_value"), Some(""));
            }
            "binder" => {
                assert_eq!(row.get("target"), Some("BRAF"));
                assert_eq!(row.get("affinity_pred_value"), Some("-1.5"));
            }
            other => panic!("unexpected base {}", other),
        }
    }
    let replicates: Vec<&str> = summary.rows.iter().filter_map(|r| r.get("replicate")).collect();
    assert_eq!(replicates, vec!["1", "2", "1", "2"]);

    let structures = fs::read_dir(out.join("final_out").join("final_pdbs"))
        .expect("structures")
        .count();
    assert_eq!(structures, 4);
    assert!(out
        .join("final_out")
        .join("final_affinity_json")
        .join("affinity_binder_rep2.json")
        .is_file());
}

#[test]
fn failed_jobs_still_appear_in_the_summary() {
    let dir = TempDir::new().expect("tempdir");
    let input = dir.path().join("experiments.csv");
    write_experiments(&input);
    let out = dir.path().join("out");
    let mut config = fake_config(1);
    config.predict.program[2] = "exit 2".to_string();

    let result = run_pipeline(&input, &out, &config, "summary.csv").expect("pipeline");

    assert_eq!(result.aggregate.summary.len(), 2);
    assert_eq!(result.aggregate.files_copied, 0);
    for row in &result.aggregate.summary.rows {
        assert_eq!(row.get("status"), Some("failed"));
        assert!(row.get("foldname").is_some());
        assert_eq!(row.get("ptm_model_0"), None);
    }
    assert!(out.join("final_out").join("summary.csv").is_file());
}
