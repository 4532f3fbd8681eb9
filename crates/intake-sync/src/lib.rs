//! Content intake pipeline: dedup, scoring, orchestration and review.

pub mod ai;
pub mod approval;
pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod reports;
pub mod scheduler;
pub mod scoring;

pub use ai::{AiAssessment, AiConfig, CompletionClient, CompletionError, HttpCompletionClient};
pub use approval::{
    list_queue, process_approval, queue_status, ApprovalError, ApprovalRequest, ApprovalResult, KindStatus,
    QueueStatusReport,
};
pub use config::{RunConfig, SyncConfig};
pub use dedup::{DedupConfig, DedupFilter, DedupVerdict};
pub use pipeline::{PipelineError, QueuedItem, RunResult, SourceRunStats, SyncPipeline};
pub use reports::{report_markdown, write_run_report};
pub use scheduler::maybe_build_scheduler;
pub use scoring::{Scorer, ScoringConfig};

pub const CRATE_NAME: &str = "intake-sync";
