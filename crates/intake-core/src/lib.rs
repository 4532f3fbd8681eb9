//! Core content model for the intake pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "intake-core";

/// A persisted row as exchanged with the data store.
pub type Row = serde_json::Map<String, JsonValue>;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "ref_src", "mc_cid", "mc_eid", "igshid"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("title is empty")]
    EmptyTitle,
    #[error("description is empty")]
    EmptyDescription,
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unknown content kind {0}")]
    UnknownKind(String),
    #[error("unknown queue status {0}")]
    UnknownStatus(String),
    #[error("unknown review action {0}")]
    UnknownAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Project,
    Funding,
    #[serde(alias = "news")]
    Resource,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [ContentKind::Project, ContentKind::Funding, ContentKind::Resource];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Project => "project",
            ContentKind::Funding => "funding",
            ContentKind::Resource => "resource",
        }
    }

    pub fn queue_table(self) -> &'static str {
        match self {
            ContentKind::Project => "queue_projects",
            ContentKind::Funding => "queue_funding_programs",
            ContentKind::Resource => "queue_resources",
        }
    }

    pub fn production_table(self) -> &'static str {
        match self {
            ContentKind::Project => "projects",
            ContentKind::Funding => "funding_programs",
            ContentKind::Resource => "resources",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "project" | "projects" => Ok(ContentKind::Project),
            "funding" | "funding_program" | "funding_programs" => Ok(ContentKind::Funding),
            "resource" | "resources" | "news" => Ok(ContentKind::Resource),
            other => Err(ItemError::UnknownKind(other.to_string())),
        }
    }
}

/// Review lifecycle of a queued item. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    PendingReview,
    UnderReview,
    Approved,
    Rejected,
    NeedsInfo,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::PendingReview,
        QueueStatus::UnderReview,
        QueueStatus::Approved,
        QueueStatus::Rejected,
        QueueStatus::NeedsInfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::PendingReview => "pending_review",
            QueueStatus::UnderReview => "under_review",
            QueueStatus::Approved => "approved",
            QueueStatus::Rejected => "rejected",
            QueueStatus::NeedsInfo => "needs_info",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Approved | QueueStatus::Rejected)
    }

    /// Status reached by applying `action`, or `None` when the transition is not allowed.
    pub fn transition(self, action: ReviewAction) -> Option<QueueStatus> {
        use QueueStatus::*;
        match (self, action) {
            (Approved | Rejected, _) => None,
            (_, ReviewAction::Approve) => Some(Approved),
            (_, ReviewAction::Reject) => Some(Rejected),
            (PendingReview | NeedsInfo, ReviewAction::StartReview) => Some(UnderReview),
            (PendingReview | UnderReview, ReviewAction::RequestInfo) => Some(NeedsInfo),
            _ => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| ItemError::UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    StartReview,
    RequestInfo,
}

impl ReviewAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Reject => "reject",
            ReviewAction::StartReview => "start_review",
            ReviewAction::RequestInfo => "request_info",
        }
    }
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewAction {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "approve" => Ok(ReviewAction::Approve),
            "reject" => Ok(ReviewAction::Reject),
            "start_review" => Ok(ReviewAction::StartReview),
            "request_info" => Ok(ReviewAction::RequestInfo),
            other => Err(ItemError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitCategory {
    HighFit,
    MediumFit,
    LowFit,
}

impl FitCategory {
    pub fn bucket(score: u8, high_at: u8, medium_at: u8) -> Self {
        if score >= high_at {
            FitCategory::HighFit
        } else if score >= medium_at {
            FitCategory::MediumFit
        } else {
            FitCategory::LowFit
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FitCategory::HighFit => "high-fit",
            FitCategory::MediumFit => "medium-fit",
            FitCategory::LowFit => "low-fit",
        }
    }
}

impl fmt::Display for FitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open key-value bag for source extras that have no typed home in [`ContentDetails`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, JsonValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        let value = value.into();
        if !value.is_null() {
            self.0.insert(key.into(), value);
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Numeric value, accepting numeric strings such as `"42"`.
    pub fn f64(&self, key: &str) -> Option<f64> {
        let value = match self.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(JsonValue::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            Some(JsonValue::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }

    pub fn datetime(&self, key: &str) -> Option<DateTime<Utc>> {
        parse_timestamp(self.str(key)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }
}

/// Parses RFC 3339 timestamps and bare `YYYY-MM-DD` dates (taken as midnight UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDetails {
    pub launched_at: Option<DateTime<Utc>>,
    pub team_size: Option<u32>,
    pub social_links: Vec<String>,
    pub traction: Option<u64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingDetails {
    pub organization: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub currency: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub eligibility: Option<String>,
    pub apply_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDetails {
    pub published_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub engagement: Option<u64>,
    pub tags: Vec<String>,
}

/// Kind-specific facts, decided once when a raw record is transformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentDetails {
    Project(ProjectDetails),
    Funding(FundingDetails),
    #[serde(alias = "news")]
    Resource(ResourceDetails),
}

impl ContentDetails {
    pub fn empty(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Project => ContentDetails::Project(ProjectDetails::default()),
            ContentKind::Funding => ContentDetails::Funding(FundingDetails::default()),
            ContentKind::Resource => ContentDetails::Resource(ResourceDetails::default()),
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            ContentDetails::Project(_) => ContentKind::Project,
            ContentDetails::Funding(_) => ContentKind::Funding,
            ContentDetails::Resource(_) => ContentKind::Resource,
        }
    }
}

/// Canonical fetched item. Only constructible through [`ContentItem::new`], which
/// enforces a valid absolute URL and non-empty title/description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentItem {
    title: String,
    url: String,
    url_key: String,
    description: String,
    source: String,
    details: ContentDetails,
    metadata: Metadata,
    fetched_at: DateTime<Utc>,
}

impl ContentItem {
    pub fn new(
        source: impl Into<String>,
        title: &str,
        url: &str,
        description: &str,
        details: ContentDetails,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, ItemError> {
        let title = collapse_whitespace(title);
        if title.is_empty() {
            return Err(ItemError::EmptyTitle);
        }
        let description = collapse_whitespace(description);
        if description.is_empty() {
            return Err(ItemError::EmptyDescription);
        }
        let parsed = parse_absolute_url(url)?;
        let url_key = normalize_parsed_url(&parsed);
        Ok(Self {
            title,
            url: parsed.to_string(),
            url_key,
            description,
            source: source.into(),
            details,
            metadata: Metadata::new(),
            fetched_at,
        })
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Normalized identity key, see [`normalize_url`].
    pub fn url_key(&self) -> &str {
        &self.url_key
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> ContentKind {
        self.details.kind()
    }

    pub fn details(&self) -> &ContentDetails {
        &self.details
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_absolute_url(raw: &str) -> Result<Url, ItemError> {
    let raw = raw.trim();
    let invalid = |reason: &str| ItemError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let parsed = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(parsed)
}

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Identity key for a URL: lower-cased scheme, host and path, no fragment,
/// tracking parameters removed, remaining parameters sorted, no trailing slash.
pub fn normalize_url(raw: &str) -> Result<String, ItemError> {
    parse_absolute_url(raw).map(|parsed| normalize_parsed_url(&parsed))
}

fn normalize_parsed_url(parsed: &Url) -> String {
    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = parsed.path().to_lowercase();
    let path = path.trim_end_matches('/');

    let mut params = parsed
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    params.sort();

    let mut key = format!("{scheme}://{host}{port}{path}");
    if !params.is_empty() {
        let query = params
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        key.push('?');
        key.push_str(&query);
    }
    key
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub rule_score: u8,
    pub ai_score: Option<u8>,
    /// Points earned per rule signal.
    pub signals: BTreeMap<String, u8>,
    /// True when the AI collaborator was configured but could not be used.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredItem {
    pub item: ContentItem,
    pub score: u8,
    pub category: FitCategory,
    pub confidence: f64,
    pub ai_summary: Option<String>,
    pub ai_reasoning: Option<String>,
    pub breakdown: ScoreBreakdown,
}

impl ScoredItem {
    /// Row inserted into the kind's queue relation; `id` and timestamps come from the store.
    pub fn to_queue_row(&self) -> Row {
        let item = &self.item;
        let mut row = Row::new();
        row.insert("kind".into(), json!(item.kind()));
        row.insert("title".into(), json!(item.title()));
        row.insert("description".into(), json!(item.description()));
        row.insert("url".into(), json!(item.url()));
        row.insert("url_key".into(), json!(item.url_key()));
        row.insert("source".into(), json!(item.source()));
        row.insert("score".into(), json!(self.score));
        row.insert("category".into(), json!(self.category));
        row.insert("confidence".into(), json!(self.confidence));
        row.insert("ai_summary".into(), json!(self.ai_summary));
        row.insert("ai_reasoning".into(), json!(self.ai_reasoning));
        row.insert("status".into(), json!(QueueStatus::PendingReview));
        row.insert("details".into(), json!(item.details()));
        row.insert("metadata".into(), json!(item.metadata()));
        row.insert("fetched_at".into(), json!(item.fetched_at()));
        row
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: Uuid,
    pub kind: ContentKind,
    pub title: String,
    pub description: String,
    pub url: String,
    pub url_key: String,
    pub source: String,
    pub score: i32,
    pub category: FitCategory,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub ai_summary: Option<String>,
    #[serde(default)]
    pub ai_reasoning: Option<String>,
    pub status: QueueStatus,
    pub details: ContentDetails,
    #[serde(default)]
    pub metadata: Metadata,
    pub fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewer_notes: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl QueueRecord {
    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(row))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub kind: ContentKind,
    pub title: String,
    pub description: String,
    pub url: String,
    pub url_key: String,
    pub source: String,
    pub score: i32,
    pub category: FitCategory,
    #[serde(default)]
    pub ai_summary: Option<String>,
    pub details: ContentDetails,
    #[serde(default)]
    pub metadata: Metadata,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

impl ProductionRecord {
    /// Copies the queue record's content; provenance is kept as `url`/`source`, not the queue id.
    pub fn promote(record: &QueueRecord, approved_by: &str, approved_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            kind: record.kind,
            title: record.title.clone(),
            description: record.description.clone(),
            url: record.url.clone(),
            url_key: record.url_key.clone(),
            source: record.source.clone(),
            score: record.score,
            category: record.category,
            ai_summary: record.ai_summary.clone(),
            details: record.details.clone(),
            metadata: record.metadata.clone(),
            approved_by: approved_by.to_string(),
            approved_at,
        }
    }

    pub fn to_row(&self) -> Result<Row, serde_json::Error> {
        match serde_json::to_value(self)? {
            JsonValue::Object(row) => Ok(row),
            other => Err(serde::ser::Error::custom(format!(
                "production record serialized to non-object {other}"
            ))),
        }
    }

    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(row))
    }
}
