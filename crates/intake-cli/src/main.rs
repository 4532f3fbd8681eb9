use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intake_core::ReviewAction;
use intake_storage::{DataStore, MemoryStore, PgStore};
use intake_sync::{process_approval, queue_status, report_markdown, ApprovalRequest, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "intake-cli")]
#[command(about = "Content intake pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, score and queue items from every enabled source once.
    Run {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        threshold: Option<u8>,
        /// Restrict the run to these source ids (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Use an in-memory store; nothing is persisted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue counts per kind and status.
    Status,
    Approve {
        id: Uuid,
        #[arg(long = "by")]
        reviewed_by: String,
        #[arg(long)]
        notes: Option<String>,
    },
    Reject {
        id: Uuid,
        #[arg(long = "by")]
        reviewed_by: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Serve the review surface.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule,
    /// Print recent run briefs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(config: &SyncConfig, in_memory: bool) -> Result<Arc<dyn DataStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryStore::with_intake_schema()));
    }
    match &config.database_url {
        Some(url) => {
            let max_connections = std::env::var("INTAKE_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            let store = PgStore::connect(url, max_connections)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store for this process");
            Ok(Arc::new(MemoryStore::with_intake_schema()))
        }
    }
}

async fn review(config: &SyncConfig, request: ApprovalRequest) -> Result<()> {
    let store = open_store(config, false).await?;
    let result = process_approval(store.as_ref(), &request).await?;
    println!(
        "{} {}: {} -> {}{}",
        result.kind,
        result.item_id,
        result.previous_status,
        result.status,
        result
            .production_id
            .map(|id| format!(" (production id {id})"))
            .unwrap_or_default()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Run {
            batch_size,
            threshold,
            sources,
            dry_run,
        } => {
            let mut run = config.run.clone();
            if let Some(batch_size) = batch_size {
                run.batch_size = batch_size;
            }
            if let Some(threshold) = threshold {
                run.score_threshold = threshold.min(100);
            }
            run.only_sources = sources;

            let store = open_store(&config, dry_run).await?;
            let pipeline = SyncPipeline::from_config(&config, store)?;
            let result = pipeline.run_once(&run).await?;
            println!(
                "run complete: run_id={} fetched={} unique={} stored={} rejected={} deferred={} errors={} reports={}",
                result.run_id,
                result.fetched,
                result.unique,
                result.stored,
                result.rejected,
                result.deferred,
                result.errors.len(),
                result.report_dir.as_deref().unwrap_or("-")
            );
            for err in &result.errors {
                println!("  error: {err}");
            }
        }
        Commands::Status => {
            let store = open_store(&config, false).await?;
            let report = queue_status(store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Approve {
            id,
            reviewed_by,
            notes,
        } => {
            let mut request = ApprovalRequest::new(id, ReviewAction::Approve, reviewed_by);
            request.notes = notes;
            review(&config, request).await?;
        }
        Commands::Reject {
            id,
            reviewed_by,
            reason,
            notes,
        } => {
            let mut request = ApprovalRequest::new(id, ReviewAction::Reject, reviewed_by);
            request.notes = notes;
            request.rejection_reason = reason;
            review(&config, request).await?;
        }
        Commands::Serve { port } => {
            let store = open_store(&config, false).await?;
            let pipeline = SyncPipeline::from_config(&config, store.clone())?;
            let state = intake_web::AppState::new(store).with_pipeline(Arc::new(pipeline), config.run.clone());
            intake_web::serve(state, port.unwrap_or(config.web_port)).await?;
        }
        Commands::Schedule => {
            let store = open_store(&config, false).await?;
            let pipeline = Arc::new(SyncPipeline::from_config(&config, store)?);
            let scheduler = intake_sync::maybe_build_scheduler(&config, pipeline, config.run.clone()).await?;
            let Some(scheduler) = scheduler else {
                anyhow::bail!("scheduler disabled; set INTAKE_SCHEDULER_ENABLED=true");
            };
            scheduler
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("starting scheduler: {e}"))?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
        Commands::Report { runs } => {
            let Some(dir) = &config.reports_dir else {
                anyhow::bail!("run reports are disabled (REPORTS_DIR=off)");
            };
            let root: PathBuf = config.workspace_root.join(dir);
            print!("{}", report_markdown(&root, runs)?);
        }
    }

    Ok(())
}
