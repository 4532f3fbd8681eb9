use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::{RunConfig, SyncConfig};
use crate::pipeline::{PipelineError, SyncPipeline};

/// Cron jobs for both configured sync times, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
    run: RunConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let pipeline = pipeline.clone();
        let run = run.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let run = run.clone();
            Box::pin(async move {
                match pipeline.run_once(&run).await {
                    Ok(result) => info!(
                        run_id = %result.run_id,
                        stored = result.stored,
                        errors = result.errors.len(),
                        "scheduled sync finished"
                    ),
                    Err(PipelineError::StorageUnavailable(err)) => {
                        error!(error = %err, "scheduled sync aborted: data store unavailable")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "scheduled sync job");
    }
    Ok(Some(sched))
}
