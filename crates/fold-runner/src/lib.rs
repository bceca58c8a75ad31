//! Batch orchestration for a structure-prediction tool: experiment rows are
//! encoded into job documents, replicated, run one at a time under a
//! wall-clock limit, and their outputs aggregated into one summary table.

pub mod aggregate;
pub mod document;
pub mod identity;
pub mod locate;
pub mod metrics;
pub mod pipeline;
pub mod replicate;
pub mod runner;
mod yaml;

pub use aggregate::{aggregate, AggregateResult, DEFAULT_SUMMARY_NAME};
pub use document::{encode_row, write_documents, write_template, JobDocument, WriteDocumentsResult};
pub use identity::{base_identifier, extract_base, job_identifier};
pub use locate::{locate_results, JobResults, ResultKind};
pub use pipeline::{run_pipeline, PipelineLayout, PipelineResult};
pub use replicate::replicate_documents;
pub use runner::{load_run_config, run_batch, run_job, BatchResult, JobOutcome, PredictOptions, RunConfig, RunRecord};
