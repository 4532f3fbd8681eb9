//! Axum + Askama review surface for the content intake queue.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use intake_core::{ContentKind, QueueRecord, QueueStatus, ReviewAction};
use intake_storage::DataStore;
use intake_sync::{
    list_queue, process_approval, queue_status, report_markdown, ApprovalError, ApprovalRequest, PipelineError,
    RunConfig, SyncPipeline,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "intake-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    /// Without a pipeline, `POST /api/runs` answers 503.
    pub pipeline: Option<Arc<SyncPipeline>>,
    pub run: RunConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            pipeline: None,
            run: RunConfig::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>, run: RunConfig) -> Self {
        self.pipeline = Some(pipeline);
        self.run = run;
        self
    }

    fn reports_dir(&self) -> Option<PathBuf> {
        self.pipeline.as_ref().and_then(|p| p.reports_dir().cloned())
    }
}

#[derive(Debug, Clone)]
struct KindRow {
    kind: String,
    pending: usize,
    under_review: usize,
    needs_info: usize,
    approved: usize,
    rejected: usize,
    production: usize,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_pending: usize,
    sources: String,
    rows: Vec<KindRow>,
    generated_at: String,
}

#[derive(Debug, Clone)]
struct QueueRow {
    id: String,
    title: String,
    url: String,
    score: i32,
    category: String,
    status: String,
    source: String,
    summary: String,
}

impl From<&QueueRecord> for QueueRow {
    fn from(record: &QueueRecord) -> Self {
        Self {
            id: record.id.to_string(),
            title: record.title.clone(),
            url: record.url.clone(),
            score: record.score,
            category: record.category.to_string(),
            status: record.status.to_string(),
            source: record.source.clone(),
            summary: record.ai_summary.clone().unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "queue.html")]
struct QueueTemplate {
    kind: String,
    status_filter: String,
    items: Vec<QueueRow>,
}

#[derive(Debug, Default, Deserialize)]
struct QueueQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    reviewed_by: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    batch_size: Option<usize>,
    threshold: Option<u8>,
    /// Comma-separated source ids.
    source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    runs: Option<usize>,
}

/// JSON error body shared by every `/api` route.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "invalid_transition", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m),
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        };
        (status, Json(json!({ "error": ErrorBody { code, message } }))).into_response()
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ApprovalError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::StorageUnavailable(_) => ApiError::Unavailable(err.to_string()),
        }
    }
}

fn parse_kind(raw: &str) -> Result<ContentKind, ApiError> {
    ContentKind::from_str(raw).map_err(|e| ApiError::NotFound(e.to_string()))
}

/// Comma-separated statuses; empty or `all` lists every status.
fn parse_statuses(raw: Option<&str>) -> Result<Vec<QueueStatus>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "all")
        .map(|s| QueueStatus::from_str(s).map_err(|e| ApiError::BadRequest(e.to_string())))
        .collect()
}

pub fn app(state: AppState) -> Router {
    // `{key}` is a kind when listing and an item id when reviewing.
    Router::new()
        .route("/", get(index_handler))
        .route("/queue/{kind}", get(queue_page_handler))
        .route("/api/status", get(status_api_handler))
        .route("/api/queue/{key}", get(queue_api_handler))
        .route("/api/queue/{key}/{action}", post(review_handler))
        .route("/api/runs", post(run_handler))
        .route("/api/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "review surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = match queue_status(state.store.as_ref()).await {
        Ok(report) => report,
        Err(err) => return server_error(err.into()),
    };
    let count = |k: &intake_sync::KindStatus, s: QueueStatus| k.counts.get(&s).copied().unwrap_or(0);
    let rows = report
        .kinds
        .iter()
        .map(|k| KindRow {
            kind: k.kind.to_string(),
            pending: count(k, QueueStatus::PendingReview),
            under_review: count(k, QueueStatus::UnderReview),
            needs_info: count(k, QueueStatus::NeedsInfo),
            approved: count(k, QueueStatus::Approved),
            rejected: count(k, QueueStatus::Rejected),
            production: k.production,
        })
        .collect();
    let sources = state
        .pipeline
        .as_ref()
        .map(|p| p.source_ids().join(", "))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "none configured".into());
    render_html(IndexTemplate {
        total_pending: report.pending(),
        sources,
        rows,
        generated_at: report.generated_at.to_rfc3339(),
    })
}

async fn queue_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<QueueQuery>,
) -> Response {
    let Ok(kind) = ContentKind::from_str(&kind) else {
        return (StatusCode::NOT_FOUND, Html(format!("Unknown kind: {kind}"))).into_response();
    };
    let statuses = match parse_statuses(query.status.as_deref()) {
        Ok(statuses) => statuses,
        Err(_) => return (StatusCode::BAD_REQUEST, Html("Unknown status".to_string())).into_response(),
    };
    match list_queue(state.store.as_ref(), kind, &statuses).await {
        Ok(records) => render_html(QueueTemplate {
            kind: kind.to_string(),
            status_filter: if statuses.is_empty() {
                "all".into()
            } else {
                statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            },
            items: records.iter().map(QueueRow::from).collect(),
        }),
        Err(err) => server_error(err.into()),
    }
}

async fn status_api_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let report = queue_status(state.store.as_ref()).await?;
    Ok(Json(report).into_response())
}

async fn queue_api_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<QueueQuery>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let statuses = parse_statuses(query.status.as_deref())?;
    let records = list_queue(state.store.as_ref(), kind, &statuses).await?;
    Ok(Json(records).into_response())
}

async fn review_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, action)): AxumPath<(String, String)>,
    Json(body): Json<ReviewBody>,
) -> Result<Response, ApiError> {
    let action = ReviewAction::from_str(&action).map_err(|e| ApiError::NotFound(e.to_string()))?;
    let item_id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest(format!("invalid item id: {id}")))?;
    if body.reviewed_by.trim().is_empty() {
        return Err(ApiError::BadRequest("reviewed_by is required".into()));
    }

    let mut request = ApprovalRequest::new(item_id, action, body.reviewed_by.trim());
    request.notes = body.notes;
    request.rejection_reason = body.reason;
    let result = process_approval(state.store.as_ref(), &request).await?;
    Ok(Json(result).into_response())
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunQuery>,
) -> Result<Response, ApiError> {
    let Some(pipeline) = state.pipeline.clone() else {
        return Err(ApiError::Unavailable("no sync pipeline configured".into()));
    };
    let mut run = state.run.clone();
    if let Some(batch_size) = query.batch_size {
        run.batch_size = batch_size;
    }
    if let Some(threshold) = query.threshold {
        run.score_threshold = threshold.min(100);
    }
    if let Some(sources) = query.source {
        run.only_sources = sources
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    let result = pipeline.run_once(&run).await?;
    Ok(Json(result).into_response())
}

async fn reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Result<Response, ApiError> {
    let Some(dir) = state.reports_dir() else {
        return Err(ApiError::Unavailable("run reports are disabled".into()));
    };
    let runs = query.runs.unwrap_or(10);
    let markdown = tokio::task::spawn_blocking(move || report_markdown(&dir, runs))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
        .map_err(ApiError::Internal)?;
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], markdown).into_response())
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "page render failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use intake_core::{ContentDetails, ContentItem, FitCategory, ProjectDetails, ScoreBreakdown, ScoredItem};
    use intake_storage::{Filter, MemoryStore};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    async fn seeded() -> (Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::with_intake_schema());
        let item = ContentItem::new(
            "hn-show",
            "Acme",
            "https://acme.io",
            "Inventory sync for small shops.",
            ContentDetails::Project(ProjectDetails::default()),
            Utc::now(),
        )
        .unwrap();
        let scored = ScoredItem {
            item,
            score: 60,
            category: FitCategory::MediumFit,
            confidence: 0.6,
            ai_summary: Some("Keeps stock in sync.".into()),
            ai_reasoning: None,
            breakdown: ScoreBreakdown::default(),
        };
        let row = store.insert("queue_projects", scored.to_queue_row()).await.unwrap();
        let id = row["id"].as_str().unwrap().to_string();
        (store, id)
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn review(id: &str, action: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/queue/{id}/{action}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let (store, _) = seeded().await;
        let resp = app(AppState::new(store))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Content Intake Dashboard"));
        assert!(text.contains("1 item(s) waiting for review"));
    }

    #[tokio::test]
    async fn queue_page_lists_items_and_rejects_unknown_kind() {
        let (store, id) = seeded().await;
        let app = app(AppState::new(store));
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/queue/project?status=pending_review").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains(&format!("item-{id}")));
        assert!(text.contains("medium-fit"));

        let missing = app
            .oneshot(Request::builder().uri("/queue/podcasts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_api_counts_pending_items() {
        let (store, _) = seeded().await;
        let resp = app(AppState::new(store))
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["kinds"][0]["kind"], "project");
        assert_eq!(body["kinds"][0]["counts"]["pending_review"], 1);
    }

    #[tokio::test]
    async fn approve_then_reject_maps_to_conflict() {
        let (store, id) = seeded().await;
        let app = app(AppState::new(store.clone()));

        let approved = app
            .clone()
            .oneshot(review(&id, "approve", json!({"reviewed_by": "maria", "notes": "solid"})))
            .await
            .unwrap();
        assert_eq!(approved.status(), StatusCode::OK);
        let body: JsonValue = serde_json::from_str(&body_text(approved).await).unwrap();
        assert_eq!(body["status"], "approved");
        assert!(body["production_id"].is_string());

        let rejected = app
            .oneshot(review(&id, "reject", json!({"reviewed_by": "maria", "reason": "dupe"})))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::CONFLICT);
        let body: JsonValue = serde_json::from_str(&body_text(rejected).await).unwrap();
        assert_eq!(body["error"]["code"], "invalid_transition");

        let production = store.select("projects", &Filter::all(), &[]).await.unwrap();
        assert_eq!(production.len(), 1);
    }

    #[tokio::test]
    async fn review_errors_map_to_status_codes() {
        let (store, _) = seeded().await;
        let app = app(AppState::new(store));

        let unknown = app
            .clone()
            .oneshot(review(&Uuid::new_v4().to_string(), "approve", json!({"reviewed_by": "maria"})))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        let body: JsonValue = serde_json::from_str(&body_text(unknown).await).unwrap();
        assert_eq!(body["error"]["code"], "not_found");

        let bad_id = app
            .oneshot(review("not-a-uuid", "approve", json!({"reviewed_by": "maria"})))
            .await
            .unwrap();
        assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_without_pipeline_is_unavailable() {
        let (store, _) = seeded().await;
        let resp = app(AppState::new(store))
            .oneshot(Request::builder().method("POST").uri("/api/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn run_against_missing_tables_is_unavailable() {
        use intake_adapters::{JsonFeedAdapter, SourceConfig, SourceFormat, SourceMode};
        use intake_storage::{HttpClientConfig, HttpFetcher, TableSpec};
        use intake_sync::{Scorer, ScoringConfig};

        let dir = tempfile::tempdir().unwrap();
        let feed = json!({
            "version": "https://jsonfeed.org/version/1.1",
            "title": "Launches",
            "items": [{
                "id": "acme",
                "title": "Acme",
                "url": "https://acme.io",
                "content_text": "Inventory sync for small shops that sell online and at the counter.",
                "date_published": Utc::now().to_rfc3339()
            }]
        });
        std::fs::write(dir.path().join("launches.json"), feed.to_string()).unwrap();
        let source = JsonFeedAdapter::new(SourceConfig {
            source_id: "launches".into(),
            display_name: "Launches".into(),
            enabled: true,
            kind: ContentKind::Project,
            format: SourceFormat::JsonFeed,
            mode: SourceMode::Fixture,
            endpoint: "https://feeds.example/launches.json".into(),
            api_key_env: None,
            selectors: None,
            fixture_path: Some("launches.json".into()),
            rate_limit: None,
        });

        let store = Arc::new(MemoryStore::new(Vec::<TableSpec>::new()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let pipeline = SyncPipeline::new(store.clone(), http, Scorer::new(ScoringConfig::default()))
            .with_workspace_root(dir.path())
            .with_source(Arc::new(source));
        let state = AppState::new(store).with_pipeline(Arc::new(pipeline), RunConfig::default());

        let resp = app(state)
            .oneshot(Request::builder().method("POST").uri("/api/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["error"]["code"], "unavailable");
    }

    #[tokio::test]
    async fn queue_api_filters_by_several_statuses() {
        let (store, id) = seeded().await;
        let app = app(AppState::new(store));

        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app
            .clone()
            .oneshot(get("/api/queue/project?status=approved,pending_review"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], id.as_str());

        let resp = app
            .clone()
            .oneshot(get("/api/queue/project?status=approved,rejected"))
            .await
            .unwrap();
        let body: JsonValue = serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(body.as_array().unwrap().is_empty());

        let bad = app.oneshot(get("/api/queue/project?status=approved,maybe")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }
}
