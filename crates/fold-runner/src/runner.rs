//! Drives the external prediction tool once per replicate document.
//!
//! Each job moves through [`JobState`]: `Pending -> Running -> Finished`,
//! where a finished job carries a [`JobOutcome`]. Failures and timeouts are
//! outcomes, not errors, so the batch loop is a plain fold that always
//! yields one [`RunRecord`] per document.

use crate::identity::replicate_number;
use crate::replicate::{list_documents, replicate_documents};
use anyhow::{anyhow, Result};
use chrono::Utc;
use fold_core::{atomic_write_json_pretty, ensure_dir, sha256_file, write_table, Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const RUN_RECORDS_FILE: &str = "run_records.csv";
pub const RUN_MANIFEST_FILE: &str = "run_manifest.json";
pub const RUN_RECORD_COLUMNS: [&str; 4] = ["filename", "replicate", "processing_time_sec", "status"];

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hyperparameters handed to the prediction tool unchanged. Defaults match
/// the tool's own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    pub program: Vec<String>,
    pub cache: Option<String>,
    pub checkpoint: Option<String>,
    pub devices: Option<u32>,
    pub accelerator: Option<String>,
    pub recycling_steps: Option<u32>,
    pub sampling_steps: Option<u32>,
    pub diffusion_samples: Option<u32>,
    pub step_scale: Option<f64>,
    pub write_full_pae: bool,
    pub write_full_pde: bool,
    pub output_format: Option<String>,
    pub num_workers: Option<u32>,
    #[serde(rename = "override")]
    pub override_existing: bool,
    pub seed: Option<u64>,
    pub use_msa_server: bool,
    pub msa_server_url: Option<String>,
    pub msa_pairing_strategy: Option<String>,
    /// Passed through verbatim after the known flags.
    pub extra_args: Vec<String>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            program: vec!["boltz".to_string(), "predict".to_string()],
            cache: None,
            checkpoint: None,
            devices: Some(1),
            accelerator: Some("gpu".to_string()),
            recycling_steps: Some(3),
            sampling_steps: Some(200),
            diffusion_samples: Some(1),
            step_scale: Some(1.638),
            write_full_pae: true,
            write_full_pde: false,
            output_format: Some("mmcif".to_string()),
            num_workers: Some(2),
            override_existing: false,
            seed: None,
            use_msa_server: false,
            msa_server_url: None,
            msa_pairing_strategy: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub num_replicates: u32,
    /// Per-job wall-clock limit in minutes; unlimited when absent.
    pub max_time_minutes: Option<f64>,
    pub predict: PredictOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_replicates: 1,
            max_time_minutes: None,
            predict: PredictOptions::default(),
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.max_time_minutes
            .filter(|m| *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0))
    }
}

pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read run config {}: {}", path.display(), e))?;
    let config: RunConfig = serde_yaml::from_str(&raw)?;
    if config.predict.program.is_empty() {
        return Err(anyhow!("run config {}: predict.program is empty", path.display()));
    }
    Ok(config)
}

fn push_flag(cmd: &mut Vec<String>, name: &str, value: Option<String>) {
    if let Some(value) = value {
        cmd.push(format!("--{}", name));
        cmd.push(value);
    }
}

fn push_switch(cmd: &mut Vec<String>, name: &str, on: bool) {
    if on {
        cmd.push(format!("--{}", name));
    }
}

/// Full argv for one job: program prefix, flags, then the document path.
pub fn construct_command(options: &PredictOptions, out_dir: &Path, document: &Path) -> Vec<String> {
    let mut cmd: Vec<String> = options.program.clone();
    push_flag(&mut cmd, "out_dir", Some(out_dir.to_string_lossy().to_string()));
    push_flag(&mut cmd, "cache", options.cache.clone());
    push_flag(&mut cmd, "checkpoint", options.checkpoint.clone());
    push_flag(&mut cmd, "devices", options.devices.map(|v| v.to_string()));
    push_flag(&mut cmd, "accelerator", options.accelerator.clone());
    push_flag(&mut cmd, "recycling_steps", options.recycling_steps.map(|v| v.to_string()));
    push_flag(&mut cmd, "sampling_steps", options.sampling_steps.map(|v| v.to_string()));
    push_flag(&mut cmd, "diffusion_samples", options.diffusion_samples.map(|v| v.to_string()));
    push_flag(&mut cmd, "step_scale", options.step_scale.map(|v| v.to_string()));
    push_switch(&mut cmd, "write_full_pae", options.write_full_pae);
    push_switch(&mut cmd, "write_full_pde", options.write_full_pde);
    push_flag(&mut cmd, "output_format", options.output_format.clone());
    push_flag(&mut cmd, "num_workers", options.num_workers.map(|v| v.to_string()));
    push_switch(&mut cmd, "override", options.override_existing);
    push_flag(&mut cmd, "seed", options.seed.map(|v| v.to_string()));
    push_switch(&mut cmd, "use_msa_server", options.use_msa_server);
    push_flag(&mut cmd, "msa_server_url", options.msa_server_url.clone());
    push_flag(&mut cmd, "msa_pairing_strategy", options.msa_pairing_strategy.clone());
    cmd.extend(options.extra_args.iter().cloned());
    cmd.push(document.to_string_lossy().to_string());
    cmd
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug)]
pub enum JobState {
    Pending,
    Running { child: Child, started: Instant },
    Finished { outcome: JobOutcome, elapsed: Duration },
}

impl JobState {
    /// Pending -> Running, or straight to Finished when the tool cannot be
    /// spawned.
    pub fn start(self, command: &[String]) -> JobState {
        if !matches!(self, JobState::Pending) {
            return self;
        }
        let started = Instant::now();
        let Some((program, args)) = command.split_first() else {
            return JobState::Finished {
                outcome: JobOutcome::Failed {
                    reason: "empty command".to_string(),
                },
                elapsed: Duration::ZERO,
            };
        };
        match Command::new(program).args(args).spawn() {
            Ok(child) => JobState::Running { child, started },
            Err(err) => JobState::Finished {
                outcome: JobOutcome::Failed {
                    reason: format!("spawn failed: {}", err),
                },
                elapsed: started.elapsed(),
            },
        }
    }

    /// Running -> Finished. With a timeout the child is killed once the
    /// limit passes and the elapsed time is capped at the limit.
    pub fn wait(self, timeout: Option<Duration>) -> JobState {
        let (mut child, started) = match self {
            JobState::Running { child, started } => (child, started),
            other => return other,
        };
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let outcome = if status.success() {
                        JobOutcome::Succeeded
                    } else {
                        JobOutcome::Failed {
                            reason: status
                                .code()
                                .map(|c| format!("exit status {}", c))
                                .unwrap_or_else(|| "signal".to_string()),
                        }
                    };
                    return JobState::Finished {
                        outcome,
                        elapsed: started.elapsed(),
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return JobState::Finished {
                        outcome: JobOutcome::Failed {
                            reason: format!("wait failed: {}", err),
                        },
                        elapsed: started.elapsed(),
                    };
                }
            }
            let elapsed = started.elapsed();
            match timeout {
                Some(limit) if elapsed >= limit => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return JobState::Finished {
                        outcome: JobOutcome::TimedOut,
                        elapsed: limit,
                    };
                }
                Some(limit) => thread::sleep(POLL_INTERVAL.min(limit - elapsed)),
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub filename: String,
    pub replicate: u32,
    pub processing_time_sec: f64,
    pub outcome: JobOutcome,
}

impl RunRecord {
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.set("filename", self.filename.clone());
        row.set("replicate", self.replicate.to_string());
        row.set("processing_time_sec", self.processing_time_sec.to_string());
        row.set("status", self.outcome.as_str());
        row
    }
}

fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

/// Runs the tool for one replicate document. Never fails: every problem
/// becomes the record's outcome.
pub fn run_job(document: &Path, options: &PredictOptions, out_dir: &Path, timeout: Option<Duration>) -> RunRecord {
    let filename = document
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let command = construct_command(options, out_dir, document);
    info!(job = %filename, command = %shell_join(&command), "running prediction");

    let state = JobState::Pending.start(&command).wait(timeout);
    let (outcome, elapsed) = match state {
        JobState::Finished { outcome, elapsed } => (outcome, elapsed),
        // start/wait only return non-finished states when handed one.
        _ => (
            JobOutcome::Failed {
                reason: "job did not finish".to_string(),
            },
            Duration::ZERO,
        ),
    };
    match &outcome {
        JobOutcome::Succeeded => info!(job = %filename, secs = elapsed.as_secs_f64(), "job succeeded"),
        JobOutcome::Failed { reason } => {
            warn!(job = %filename, reason = %reason, "job failed, moving to next document")
        }
        JobOutcome::TimedOut => {
            warn!(job = %filename, limit_secs = elapsed.as_secs_f64(), "job exceeded max time, moving to next document")
        }
    }
    RunRecord {
        replicate: replicate_number(&filename),
        filename,
        processing_time_sec: round_secs(elapsed),
        outcome,
    }
}

pub struct BatchResult {
    pub replicates_dir: PathBuf,
    pub records: Vec<RunRecord>,
    pub records_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Replicates every document in `input_dir`, runs each replicate in turn
/// and writes `run_records.csv` plus `run_manifest.json` to `out_dir`.
pub fn run_batch(input_dir: &Path, out_dir: &Path, config: &RunConfig) -> Result<BatchResult> {
    if config.predict.program.is_empty() {
        return Err(anyhow!("predict.program is empty"));
    }
    ensure_dir(out_dir)?;
    let replicates_dir = replicate_documents(input_dir, config.num_replicates)?;
    let jobs = list_documents(&replicates_dir)?;
    info!(jobs = jobs.len(), dir = %replicates_dir.display(), "starting batch");

    let timeout = config.timeout();
    let mut documents = Vec::new();
    let mut records = Vec::with_capacity(jobs.len());
    for job in &jobs {
        documents.push(json!({
            "filename": job.file_name().map(|s| s.to_string_lossy().to_string()),
            "digest": sha256_file(job).ok(),
        }));
        records.push(run_job(job, &config.predict, out_dir, timeout));
    }

    let mut table = Table::with_columns(RUN_RECORD_COLUMNS);
    for record in &records {
        table.push(record.to_row());
    }
    let records_path = out_dir.join(RUN_RECORDS_FILE);
    write_table(&records_path, &table)?;

    let mut outcomes: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &records {
        *outcomes.entry(record.outcome.as_str()).or_default() += 1;
    }
    let manifest = json!({
        "schema_version": "run_manifest_v1",
        "runner_version": env!("CARGO_PKG_VERSION"),
        "created_at": Utc::now().to_rfc3339(),
        "input_dir": input_dir.display().to_string(),
        "replicates_dir": replicates_dir.display().to_string(),
        "config": serde_json::to_value(config)?,
        "documents": documents,
        "outcomes": outcomes,
    });
    let manifest_path = out_dir.join(RUN_MANIFEST_FILE);
    atomic_write_json_pretty(&manifest_path, &manifest)?;
    info!(records = %records_path.display(), ?outcomes, "batch finished");

    Ok(BatchResult {
        replicates_dir,
        records,
        records_path,
        manifest_path,
    })
}
