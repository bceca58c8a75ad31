use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use fold_runner::{
    aggregate, load_run_config, run_batch, run_pipeline, write_documents, write_template,
    AggregateResult, BatchResult, PredictOptions, RunConfig, DEFAULT_SUMMARY_NAME,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fold", version, about = "Batch structure-prediction runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Run configuration: an optional YAML file, then individual overrides.
#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Per-job wall-clock limit in minutes.
    #[arg(long)]
    max_time: Option<f64>,
    #[arg(long)]
    num_replicates: Option<u32>,
    #[command(flatten)]
    predict: PredictArgs,
}

/// Prediction tool hyperparameters; each one replaces the configured value.
#[derive(Args, Debug, Clone, Default)]
struct PredictArgs {
    /// Program and leading arguments, e.g. `--program boltz --program predict`.
    #[arg(long = "program", allow_hyphen_values = true)]
    program: Vec<String>,
    #[arg(long)]
    cache: Option<String>,
    #[arg(long)]
    checkpoint: Option<String>,
    #[arg(long)]
    devices: Option<u32>,
    #[arg(long)]
    accelerator: Option<String>,
    #[arg(long)]
    recycling_steps: Option<u32>,
    #[arg(long)]
    sampling_steps: Option<u32>,
    #[arg(long)]
    diffusion_samples: Option<u32>,
    #[arg(long)]
    step_scale: Option<f64>,
    #[arg(long)]
    write_full_pae: Option<bool>,
    #[arg(long)]
    write_full_pde: Option<bool>,
    #[arg(long)]
    output_format: Option<String>,
    #[arg(long)]
    num_workers: Option<u32>,
    #[arg(long = "override")]
    override_existing: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    use_msa_server: bool,
    #[arg(long)]
    msa_server_url: Option<String>,
    #[arg(long)]
    msa_pairing_strategy: Option<String>,
    /// Extra tool argument passed through verbatim; repeatable.
    #[arg(long = "extra-arg", allow_hyphen_values = true)]
    extra_args: Vec<String>,
}

impl PredictArgs {
    fn apply(&self, options: &mut PredictOptions) {
        if !self.program.is_empty() {
            options.program = self.program.clone();
        }
        set_if_some(&mut options.cache, &self.cache);
        set_if_some(&mut options.checkpoint, &self.checkpoint);
        set_if_some(&mut options.devices, &self.devices);
        set_if_some(&mut options.accelerator, &self.accelerator);
        set_if_some(&mut options.recycling_steps, &self.recycling_steps);
        set_if_some(&mut options.sampling_steps, &self.sampling_steps);
        set_if_some(&mut options.diffusion_samples, &self.diffusion_samples);
        set_if_some(&mut options.step_scale, &self.step_scale);
        set_if_some(&mut options.output_format, &self.output_format);
        set_if_some(&mut options.num_workers, &self.num_workers);
        set_if_some(&mut options.seed, &self.seed);
        set_if_some(&mut options.msa_server_url, &self.msa_server_url);
        set_if_some(&mut options.msa_pairing_strategy, &self.msa_pairing_strategy);
        if let Some(on) = self.write_full_pae {
            options.write_full_pae = on;
        }
        if let Some(on) = self.write_full_pde {
            options.write_full_pde = on;
        }
        if self.override_existing {
            options.override_existing = true;
        }
        if self.use_msa_server {
            options.use_msa_server = true;
        }
        options.extra_args.extend(self.extra_args.iter().cloned());
    }
}

fn set_if_some<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example experiment table listing every recognised column.
    Template {
        #[arg(default_value = "template.csv")]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Encode each experiment row into a job document.
    WriteSpecs {
        #[arg(long)]
        input_csv: PathBuf,
        #[arg(long)]
        yaml_out_dir: PathBuf,
        #[arg(long)]
        csv_out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Replicate and run every job document in a directory.
    Run {
        input_dir: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    /// Join run records with experiment metadata and collect result files.
    Aggregate {
        #[arg(long)]
        yaml_csv: PathBuf,
        #[arg(long)]
        runs_csv: PathBuf,
        #[arg(long)]
        predictions_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_SUMMARY_NAME)]
        summary_csv_name: String,
        #[arg(long)]
        json: bool,
    },
    /// Encode, run and aggregate in one go.
    Pipeline {
        #[arg(long)]
        input_csv: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value = DEFAULT_SUMMARY_NAME)]
        summary_csv_name: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Diagnostics go to stderr so stdout stays machine-readable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Template { path, json } => {
            write_template(&path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "template",
                    "path": path.display().to_string()
                })));
            }
            println!("template: {}", path.display());
        }
        Commands::WriteSpecs {
            input_csv,
            yaml_out_dir,
            csv_out,
            json,
        } => {
            let result = write_documents(&input_csv, &yaml_out_dir, &csv_out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "write-specs",
                    "documents": paths_to_json(&result.documents),
                    "table": result.table_path.display().to_string()
                })));
            }
            println!("documents: {}", result.documents.len());
            println!("yaml_out_dir: {}", yaml_out_dir.display());
            println!("table: {}", result.table_path.display());
        }
        Commands::Run {
            input_dir,
            out_dir,
            run,
            json,
        } => {
            let config = resolve_config(&run)?;
            let result = run_batch(&input_dir, &out_dir, &config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "batch": batch_to_json(&result)
                })));
            }
            print_batch(&result);
        }
        Commands::Aggregate {
            yaml_csv,
            runs_csv,
            predictions_dir,
            output_dir,
            summary_csv_name,
            json,
        } => {
            let result = aggregate(
                &yaml_csv,
                &runs_csv,
                &predictions_dir,
                &output_dir,
                &summary_csv_name,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "aggregate": aggregate_to_json(&result)
                })));
            }
            print_aggregate(&result);
        }
        Commands::Pipeline {
            input_csv,
            output_dir,
            run,
            summary_csv_name,
            json,
        } => {
            let config = resolve_config(&run)?;
            let result = run_pipeline(&input_csv, &output_dir, &config, &summary_csv_name)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "pipeline",
                    "documents": paths_to_json(&result.documents.documents),
                    "batch": batch_to_json(&result.batch),
                    "aggregate": aggregate_to_json(&result.aggregate)
                })));
            }
            println!("documents: {}", result.documents.documents.len());
            print_batch(&result.batch);
            print_aggregate(&result.aggregate);
        }
    }
    Ok(None)
}

fn resolve_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => load_run_config(path)?,
        None => RunConfig::default(),
    };
    if let Some(minutes) = args.max_time {
        if minutes < 0.0 {
            return Err(anyhow!("--max-time must not be negative"));
        }
        config.max_time_minutes = Some(minutes);
    }
    if let Some(n) = args.num_replicates {
        config.num_replicates = n;
    }
    args.predict.apply(&mut config.predict);
    if config.num_replicates == 0 {
        return Err(anyhow!("--num-replicates must be at least 1"));
    }
    Ok(config)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Template { json, .. }
        | Commands::WriteSpecs { json, .. }
        | Commands::Run { json, .. }
        | Commands::Aggregate { json, .. }
        | Commands::Pipeline { json, .. } => *json,
    }
}

fn paths_to_json(paths: &[PathBuf]) -> Value {
    Value::Array(
        paths
            .iter()
            .map(|p| Value::String(p.display().to_string()))
            .collect(),
    )
}

fn batch_to_json(result: &BatchResult) -> Value {
    let records: Vec<Value> = result
        .records
        .iter()
        .map(|r| {
            json!({
                "filename": r.filename,
                "replicate": r.replicate,
                "processing_time_sec": r.processing_time_sec,
                "status": r.outcome.as_str()
            })
        })
        .collect();
    json!({
        "replicates_dir": result.replicates_dir.display().to_string(),
        "records_path": result.records_path.display().to_string(),
        "manifest_path": result.manifest_path.display().to_string(),
        "records": records
    })
}

fn aggregate_to_json(result: &AggregateResult) -> Value {
    json!({
        "summary_path": result.summary_path.display().to_string(),
        "rows": result.summary.len(),
        "columns": result.summary.columns,
        "jobs": result.jobs,
        "files_copied": result.files_copied
    })
}

fn print_batch(result: &BatchResult) {
    let failed = result
        .records
        .iter()
        .filter(|r| r.outcome.as_str() != "succeeded")
        .count();
    println!("jobs: {}", result.records.len());
    println!("jobs_not_succeeded: {}", failed);
    println!("replicates_dir: {}", result.replicates_dir.display());
    println!("run_records: {}", result.records_path.display());
    println!("run_manifest: {}", result.manifest_path.display());
}

fn print_aggregate(result: &AggregateResult) {
    println!("summary_rows: {}", result.summary.len());
    println!("jobs: {}", result.jobs);
    println!("files_copied: {}", result.files_copied);
    println!("summary: {}", result.summary_path.display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = RunArgs {
            max_time: Some(2.5),
            num_replicates: Some(3),
            predict: PredictArgs {
                seed: Some(11),
                accelerator: Some("cpu".to_string()),
                use_msa_server: true,
                recycling_steps: Some(10),
                sampling_steps: Some(50),
                diffusion_samples: Some(5),
                step_scale: Some(1.2),
                devices: Some(2),
                cache: Some("/models".to_string()),
                checkpoint: Some("/models/boltz2.ckpt".to_string()),
                output_format: Some("pdb".to_string()),
                num_workers: Some(4),
                override_existing: true,
                write_full_pae: Some(false),
                write_full_pde: Some(true),
                msa_server_url: Some("https://msa.example".to_string()),
                msa_pairing_strategy: Some("complete".to_string()),
                extra_args: vec!["--no_kernels".to_string()],
                ..PredictArgs::default()
            },
            ..RunArgs::default()
        };
        let config = resolve_config(&args).expect("config");
        assert_eq!(config.max_time_minutes, Some(2.5));
        assert_eq!(config.num_replicates, 3);
        let p = &config.predict;
        assert_eq!(p.seed, Some(11));
        assert_eq!(p.accelerator.as_deref(), Some("cpu"));
        assert!(p.use_msa_server);
        assert_eq!(p.recycling_steps, Some(10));
        assert_eq!(p.sampling_steps, Some(50));
        assert_eq!(p.diffusion_samples, Some(5));
        assert_eq!(p.step_scale, Some(1.2));
        assert_eq!(p.devices, Some(2));
        assert_eq!(p.cache.as_deref(), Some("/models"));
        assert_eq!(p.checkpoint.as_deref(), Some("/models/boltz2.ckpt"));
        assert_eq!(p.output_format.as_deref(), Some("pdb"));
        assert_eq!(p.num_workers, Some(4));
        assert!(p.override_existing);
        assert!(!p.write_full_pae);
        assert!(p.write_full_pde);
        assert_eq!(p.msa_server_url.as_deref(), Some("https://msa.example"));
        assert_eq!(p.msa_pairing_strategy.as_deref(), Some("complete"));
        assert_eq!(p.extra_args, vec!["--no_kernels"]);
        assert_eq!(p.program, vec!["boltz", "predict"]);
    }

    #[test]
    fn unset_flags_keep_defaults() {
        let config = resolve_config(&RunArgs::default()).expect("config");
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn hyperparameter_flags_parse() {
        let cli = Cli::try_parse_from([
            "fold",
            "run",
            "jobs",
            "--out-dir",
            "raw",
            "--recycling-steps",
            "10",
            "--step-scale",
            "1.5",
            "--write-full-pae",
            "false",
            "--override",
            "--extra-arg",
            "--no_kernels",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run { run, .. } => {
                let config = resolve_config(&run).expect("config");
                assert_eq!(config.predict.recycling_steps, Some(10));
                assert_eq!(config.predict.step_scale, Some(1.5));
                assert!(!config.predict.write_full_pae);
                assert!(config.predict.override_existing);
                assert_eq!(config.predict.extra_args, vec!["--no_kernels"]);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn zero_replicates_is_rejected_up_front() {
        let args = RunArgs {
            num_replicates: Some(0),
            ..RunArgs::default()
        };
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn pipeline_flags_parse() {
        let cli = Cli::try_parse_from([
            "fold",
            "pipeline",
            "--input-csv",
            "in.csv",
            "--output-dir",
            "out",
            "--max-time",
            "30",
            "--num-replicates",
            "2",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Pipeline {
                run,
                summary_csv_name,
                json,
                ..
            } => {
                assert_eq!(run.max_time, Some(30.0));
                assert_eq!(run.num_replicates, Some(2));
                assert_eq!(summary_csv_name, DEFAULT_SUMMARY_NAME);
                assert!(json);
            }
            _ => panic!("expected pipeline command"),
        }
    }
}
