//! Run orchestration: fetch, transform, dedup, score and enqueue, one source at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use intake_adapters::{adapter_for_source, AdapterContext, AdapterError, SourceAdapter, SourceRegistry};
use intake_core::{ContentItem, ContentKind, FitCategory};
use intake_storage::{ArtifactStore, DataStore, HttpClientConfig, HttpFetcher, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ai::HttpCompletionClient;
use crate::config::{RunConfig, SyncConfig};
use crate::dedup::{DedupConfig, DedupFilter, DedupVerdict};
use crate::reports;
use crate::scoring::Scorer;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("data store unavailable, run aborted: {0}")]
    StorageUnavailable(#[source] StoreError),
}

/// One item written to a queue relation during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: Option<String>,
    pub source_id: String,
    pub kind: ContentKind,
    pub title: String,
    pub url_key: String,
    pub score: u8,
    pub category: FitCategory,
    pub confidence: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRunStats {
    pub source_id: String,
    pub fetched: usize,
    pub unique: usize,
    pub scored: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub below_threshold: usize,
    pub conflicts: usize,
    pub deferred: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SourceRunStats {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Default::default()
        }
    }

    pub fn rejected(&self) -> usize {
        self.duplicates + self.below_threshold + self.conflicts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub unique: usize,
    pub scored: usize,
    pub stored: usize,
    /// Duplicates, below-threshold items and storage conflicts.
    pub rejected: usize,
    pub deferred: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub sources: Vec<SourceRunStats>,
    pub queued: Vec<QueuedItem>,
    pub report_dir: Option<String>,
}

enum ItemOutcome {
    Duplicate(DedupVerdict),
    BelowThreshold,
    Conflict,
    Stored(QueuedItem),
    Failed(String),
}

fn fatal(err: StoreError) -> Result<ItemOutcome, PipelineError> {
    if err.is_fatal() {
        Err(PipelineError::StorageUnavailable(err))
    } else {
        Ok(ItemOutcome::Failed(err.to_string()))
    }
}

pub struct SyncPipeline {
    store: Arc<dyn DataStore>,
    http: HttpFetcher,
    sources: Vec<Arc<dyn SourceAdapter>>,
    dedup: DedupFilter,
    scorer: Scorer,
    artifacts: Option<ArtifactStore>,
    reports_dir: Option<PathBuf>,
    workspace_root: PathBuf,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn DataStore>, http: HttpFetcher, scorer: Scorer) -> Self {
        Self {
            dedup: DedupFilter::new(store.clone(), DedupConfig::default()),
            store,
            http,
            sources: Vec::new(),
            scorer,
            artifacts: None,
            reports_dir: None,
            workspace_root: PathBuf::from("."),
            run_lock: Mutex::new(()),
        }
    }

    /// Wires store, HTTP client, scorer, sources and output directories from the environment config.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn DataStore>) -> anyhow::Result<Self> {
        let registry = SourceRegistry::load(config.workspace_root.join(&config.sources_path))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            source_rate_limits: registry.rate_limits(),
            ..Default::default()
        })?;
        let mut scorer = Scorer::new(config.scoring.clone());
        if let Some(ai) = &config.ai {
            let client = HttpCompletionClient::new(ai.clone()).context("building completion client")?;
            scorer = scorer.with_ai(Arc::new(client));
        } else {
            info!("AI_API_KEY not set; scoring with rules only");
        }

        let mut pipeline = Self::new(store, http, scorer)
            .with_workspace_root(config.workspace_root.clone())
            .with_registry(&registry)
            .context("building source adapters")?;
        if let Some(dir) = &config.artifacts_dir {
            pipeline = pipeline.with_artifacts(ArtifactStore::new(config.workspace_root.join(dir)));
        }
        if let Some(dir) = &config.reports_dir {
            pipeline = pipeline.with_reports_dir(config.workspace_root.join(dir));
        }
        Ok(pipeline)
    }

    pub fn with_registry(mut self, registry: &SourceRegistry) -> Result<Self, AdapterError> {
        for source in registry.enabled() {
            self.sources.push(Arc::from(adapter_for_source(source)?));
        }
        Ok(self)
    }

    pub fn with_source(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(adapter);
        self
    }

    pub fn with_dedup_config(mut self, config: DedupConfig) -> Self {
        self.dedup = DedupFilter::new(self.store.clone(), config);
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    pub fn reports_dir(&self) -> Option<&PathBuf> {
        self.reports_dir.as_ref()
    }

    /// Runs every selected source once. Runs never overlap: a second caller waits.
    pub async fn run_once(&self, run: &RunConfig) -> Result<RunResult, PipelineError> {
        let _running = self.run_lock.lock().await;
        let clock = Instant::now();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
            workspace_root: self.workspace_root.clone(),
        };
        info!(%run_id, sources = self.sources.len(), batch_size = run.batch_size, threshold = run.score_threshold, "sync run started");

        let mut sources = Vec::new();
        let mut queued = Vec::new();
        for adapter in self.sources.iter().filter(|a| run.includes(a.source_id())) {
            let span = info_span!("source_run", %run_id, source_id = %adapter.source_id(), kind = %adapter.kind());
            let (stats, stored) = self
                .run_source(adapter.as_ref(), &ctx, run)
                .instrument(span)
                .await?;
            sources.push(stats);
            queued.extend(stored);
        }

        let sum = |f: fn(&SourceRunStats) -> usize| sources.iter().map(f).sum::<usize>();
        let mut result = RunResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched: sum(|s| s.fetched),
            unique: sum(|s| s.unique),
            scored: sum(|s| s.scored),
            stored: sum(|s| s.stored),
            rejected: sum(SourceRunStats::rejected),
            deferred: sum(|s| s.deferred),
            errors: sources
                .iter()
                .flat_map(|s| s.errors.iter().map(move |e| format!("{}: {e}", s.source_id)))
                .collect(),
            duration_ms: clock.elapsed().as_millis() as u64,
            sources,
            queued,
            report_dir: None,
        };

        if let Some(root) = &self.reports_dir {
            match reports::write_run_report(root, &result).await {
                Ok(dir) => result.report_dir = Some(dir.display().to_string()),
                Err(err) => warn!(%run_id, error = %err, "failed to write run report"),
            }
        }

        info!(
            %run_id,
            fetched = result.fetched,
            stored = result.stored,
            rejected = result.rejected,
            deferred = result.deferred,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "sync run finished"
        );
        Ok(result)
    }

    async fn run_source(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        run: &RunConfig,
    ) -> Result<(SourceRunStats, Vec<QueuedItem>), PipelineError> {
        let clock = Instant::now();
        let mut stats = SourceRunStats::new(adapter.source_id());

        let payloads = match tokio::time::timeout(run.fetch_timeout, adapter.fetch(&self.http, ctx)).await {
            Ok(Ok(payloads)) => payloads,
            Ok(Err(err)) => {
                warn!(error = %err, "fetch failed");
                stats.errors.push(format!("fetch failed: {err}"));
                stats.duration_ms = clock.elapsed().as_millis() as u64;
                return Ok((stats, Vec::new()));
            }
            Err(_) => {
                warn!(timeout_secs = run.fetch_timeout.as_secs(), "fetch timed out");
                stats.errors.push(format!("fetch timed out after {:?}", run.fetch_timeout));
                stats.duration_ms = clock.elapsed().as_millis() as u64;
                return Ok((stats, Vec::new()));
            }
        };

        let mut items: Vec<ContentItem> = Vec::new();
        for payload in &payloads {
            if let Some(artifacts) = &self.artifacts {
                match artifacts
                    .store_bytes(payload.fetched_at, &payload.source_id, adapter.format().extension(), &payload.body)
                    .await
                {
                    Ok(archived) => debug!(
                        path = %archived.path.display(),
                        already_present = archived.already_present,
                        "raw payload archived"
                    ),
                    Err(err) => warn!(error = %err, "failed to archive raw payload"),
                }
            }
            match adapter.transform(payload) {
                Ok(batch) => items.extend(batch),
                Err(err) => {
                    warn!(url = %payload.url, error = %err, "payload rejected");
                    stats.errors.push(format!("transform failed: {err}"));
                }
            }
        }

        stats.fetched = items.len();
        if items.is_empty() {
            stats.duration_ms = clock.elapsed().as_millis() as u64;
            return Ok((stats, Vec::new()));
        }

        if let Err(err) = self.dedup.prepare(adapter.kind()).await {
            if err.is_fatal() {
                return Err(PipelineError::StorageUnavailable(err));
            }
            stats.errors.push(format!("loading dedup index failed: {err}"));
            stats.duration_ms = clock.elapsed().as_millis() as u64;
            return Ok((stats, Vec::new()));
        }

        // Already-known urls do not use up the batch, so deferred items are reached on later runs.
        let known = self.dedup.known_url_keys(adapter.kind()).await;
        let before = items.len();
        items.retain(|item| !known.contains(item.url_key()));
        stats.duplicates += before - items.len();
        if items.len() > run.batch_size {
            stats.deferred = items.len() - run.batch_size;
            items.truncate(run.batch_size);
        }

        let outcomes = stream::iter(items.into_iter().map(|item| self.process_item(item, run)))
            .buffer_unordered(run.effective_in_flight())
            .collect::<Vec<_>>()
            .await;

        let mut stored = Vec::new();
        for outcome in outcomes {
            match outcome? {
                ItemOutcome::Duplicate(verdict) => {
                    debug!(?verdict, "duplicate skipped");
                    stats.duplicates += 1;
                }
                ItemOutcome::BelowThreshold => {
                    stats.unique += 1;
                    stats.scored += 1;
                    stats.below_threshold += 1;
                }
                ItemOutcome::Conflict => {
                    stats.unique += 1;
                    stats.scored += 1;
                    stats.conflicts += 1;
                }
                ItemOutcome::Stored(item) => {
                    stats.unique += 1;
                    stats.scored += 1;
                    stats.stored += 1;
                    stored.push(item);
                }
                ItemOutcome::Failed(message) => stats.errors.push(message),
            }
        }
        stats.duration_ms = clock.elapsed().as_millis() as u64;
        info!(
            fetched = stats.fetched,
            unique = stats.unique,
            stored = stats.stored,
            rejected = stats.rejected(),
            deferred = stats.deferred,
            "source processed"
        );
        Ok((stats, stored))
    }

    async fn process_item(&self, item: ContentItem, run: &RunConfig) -> Result<ItemOutcome, PipelineError> {
        match self.dedup.check(&item).await {
            Ok(DedupVerdict::Unique) => {}
            Ok(verdict) => return Ok(ItemOutcome::Duplicate(verdict)),
            Err(err) => return fatal(err),
        }

        let scored = self.scorer.score_content(item).await;
        if scored.score < run.score_threshold {
            debug!(url_key = %scored.item.url_key(), score = scored.score, "below threshold");
            return Ok(ItemOutcome::BelowThreshold);
        }

        let table = scored.item.kind().queue_table();
        match self.store.insert(table, scored.to_queue_row()).await {
            Ok(row) => {
                self.dedup.record(&scored.item).await;
                Ok(ItemOutcome::Stored(QueuedItem {
                    id: row.get("id").and_then(|v| v.as_str()).map(str::to_string),
                    source_id: scored.item.source().to_string(),
                    kind: scored.item.kind(),
                    title: scored.item.title().to_string(),
                    url_key: scored.item.url_key().to_string(),
                    score: scored.score,
                    category: scored.category,
                    confidence: scored.confidence,
                    degraded: scored.breakdown.degraded,
                }))
            }
            Err(err) if err.is_unique_violation() => {
                debug!(url_key = %scored.item.url_key(), "already queued by a concurrent insert");
                Ok(ItemOutcome::Conflict)
            }
            Err(err) => {
                let outcome = fatal(err)?;
                if let ItemOutcome::Failed(message) = &outcome {
                    warn!(url_key = %scored.item.url_key(), error = %message, "insert failed");
                }
                Ok(outcome)
            }
        }
    }
}
