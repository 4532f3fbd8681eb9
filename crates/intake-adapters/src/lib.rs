//! Source adapter contracts and the per-format fetch/transform implementations.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use intake_core::{
    ContentDetails, ContentItem, ContentKind, FundingDetails, Metadata, ProjectDetails,
    ResourceDetails,
};
use intake_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

mod github_search;
mod hn_algolia;
mod html_listing;
mod json_feed;
mod sources;
mod text;

pub use github_search::GithubSearchAdapter;
pub use hn_algolia::HnAlgoliaAdapter;
pub use html_listing::HtmlListingAdapter;
pub use json_feed::JsonFeedAdapter;
pub use sources::{HtmlSelectors, SourceConfig, SourceFormat, SourceMode, SourceRegistry};

use text::AmountRange;

pub const CRATE_NAME: &str = "intake-adapters";

/// Source-native bytes exactly as fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_id: String,
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn text(&self) -> Result<&str, AdapterError> {
        std::str::from_utf8(&self.body).map_err(|e| self.parse_error(format!("body is not utf-8: {e}")))
    }

    pub fn json(&self) -> Result<JsonValue, AdapterError> {
        serde_json::from_slice(&self.body).map_err(|e| self.parse_error(format!("invalid json: {e}")))
    }

    fn parse_error(&self, reason: impl Into<String>) -> AdapterError {
        AdapterError::Parse {
            source_id: self.source_id.clone(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// Base for relative `fixture_path` entries.
    pub workspace_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("payload from {source_id} is not a valid document: {reason}")]
    Parse { source_id: String, reason: String },
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> ContentKind;
    fn format(&self) -> SourceFormat;

    /// Retrieves the source's raw payloads without modifying them.
    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawPayload>, AdapterError>;

    /// Pure and deterministic. Records that cannot form a valid item are skipped.
    fn transform(&self, raw: &RawPayload) -> Result<Vec<ContentItem>, AdapterError>;
}

pub fn adapter_for_source(config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    Ok(match config.format {
        SourceFormat::HnAlgolia => Box::new(HnAlgoliaAdapter::new(config.clone())),
        SourceFormat::GithubSearch => Box::new(GithubSearchAdapter::new(config.clone())),
        SourceFormat::JsonFeed => Box::new(JsonFeedAdapter::new(config.clone())),
        SourceFormat::HtmlListing => Box::new(HtmlListingAdapter::new(config.clone())?),
    })
}

/// Reads the configured fixture file or performs the live GET for `config`.
pub async fn fetch_source_payload(
    config: &SourceConfig,
    http: &HttpFetcher,
    ctx: &AdapterContext,
    extra_headers: &[(&str, String)],
) -> Result<RawPayload, AdapterError> {
    let default_content_type = match config.format {
        SourceFormat::HtmlListing => "text/html",
        _ => "application/json",
    };

    if config.mode == SourceMode::Fixture {
        let rel = config.fixture_path.as_ref().ok_or_else(|| {
            AdapterError::Message(format!("source {} has no fixture_path", config.source_id))
        })?;
        let path = ctx.workspace_root.join(rel);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|source| AdapterError::Fixture { path: path.clone(), source })?;
        debug!(source_id = %config.source_id, path = %path.display(), bytes = body.len(), "loaded fixture payload");
        return Ok(RawPayload {
            source_id: config.source_id.clone(),
            url: config.endpoint.clone(),
            content_type: default_content_type.to_string(),
            body,
            fetched_at: ctx.fetched_at,
        });
    }

    let mut headers = extra_headers.to_vec();
    if let Some(env_name) = &config.api_key_env {
        match std::env::var(env_name) {
            Ok(key) if !key.trim().is_empty() => {
                headers.push(("authorization", format!("Bearer {}", key.trim())));
            }
            _ => warn!(source_id = %config.source_id, env = %env_name, "api key not set; fetching anonymously"),
        }
    }

    let response = http
        .fetch_bytes(ctx.run_id, &config.source_id, &config.endpoint, &headers)
        .await?;
    Ok(RawPayload {
        source_id: config.source_id.clone(),
        url: response.url,
        content_type: response
            .content_type
            .unwrap_or_else(|| default_content_type.to_string()),
        body: response.body,
        fetched_at: ctx.fetched_at,
    })
}

fn check_source(config: &SourceConfig, raw: &RawPayload) -> Result<(), AdapterError> {
    if raw.source_id != config.source_id {
        return Err(AdapterError::Message(format!(
            "payload source_id={} does not match adapter source_id={}",
            raw.source_id, config.source_id
        )));
    }
    Ok(())
}

/// Format-neutral fields pulled out of one source record before the kind decides
/// which of them end up in [`ContentDetails`].
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordFields {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub engagement: Option<u64>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub team_size: Option<u32>,
    pub amount: AmountRange,
    pub deadline: Option<NaiveDate>,
    pub eligibility: Option<String>,
    pub organization: Option<String>,
    pub apply_url: Option<String>,
    pub metadata: Metadata,
}

impl RecordFields {
    fn details(&self, kind: ContentKind) -> ContentDetails {
        match kind {
            ContentKind::Project => ContentDetails::Project(ProjectDetails {
                launched_at: self.published_at,
                team_size: self.team_size,
                social_links: self.links.clone(),
                traction: self.engagement,
                tags: self.tags.clone(),
            }),
            ContentKind::Funding => ContentDetails::Funding(FundingDetails {
                organization: self.organization.clone().or_else(|| self.author.clone()),
                amount_min: self.amount.min,
                amount_max: self.amount.max,
                currency: self.amount.currency.clone(),
                deadline: self.deadline,
                eligibility: self.eligibility.clone(),
                apply_url: self.apply_url.clone().or_else(|| self.url.clone()),
            }),
            ContentKind::Resource => ContentDetails::Resource(ResourceDetails {
                published_at: self.published_at,
                author: self.author.clone(),
                engagement: self.engagement,
                tags: self.tags.clone(),
            }),
        }
    }
}

/// Turns extracted records into items, dropping the ones that fail validation.
pub(crate) fn build_items(
    source_id: &str,
    kind: ContentKind,
    fetched_at: DateTime<Utc>,
    records: Vec<RecordFields>,
) -> Vec<ContentItem> {
    let total = records.len();
    let items = records
        .into_iter()
        .enumerate()
        .filter_map(|(idx, record)| {
            let details = record.details(kind);
            let built = ContentItem::new(
                source_id,
                record.title.as_deref().unwrap_or_default(),
                record.url.as_deref().unwrap_or_default(),
                record.description.as_deref().unwrap_or_default(),
                details,
                fetched_at,
            );
            match built {
                Ok(item) => Some(item.with_metadata(record.metadata)),
                Err(err) => {
                    debug!(source_id, record = idx, error = %err, "skipping record");
                    None
                }
            }
        })
        .collect::<Vec<_>>();
    debug!(source_id, total, kept = items.len(), "transformed payload");
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn record_fields_map_into_kind_specific_details() {
        let record = RecordFields {
            title: Some("Seed Grant".into()),
            url: Some("https://grants.example/seed".into()),
            description: Some("Non-dilutive seed funding.".into()),
            author: Some("Example Foundation".into()),
            amount: AmountRange {
                min: Some(10_000.0),
                max: Some(50_000.0),
                currency: Some("USD".into()),
            },
            ..Default::default()
        };
        let ContentDetails::Funding(funding) = record.details(ContentKind::Funding) else {
            panic!("funding details expected");
        };
        assert_eq!(funding.organization.as_deref(), Some("Example Foundation"));
        assert_eq!(funding.apply_url.as_deref(), Some("https://grants.example/seed"));
        assert_eq!(funding.amount_max, Some(50_000.0));

        let ContentDetails::Resource(resource) = record.details(ContentKind::Resource) else {
            panic!("resource details expected");
        };
        assert_eq!(resource.author.as_deref(), Some("Example Foundation"));
    }

    #[test]
    fn build_items_skips_invalid_records() {
        let good = RecordFields {
            title: Some("Acme".into()),
            url: Some("https://acme.io".into()),
            description: Some("Widgets for teams".into()),
            ..Default::default()
        };
        let no_url = RecordFields {
            url: None,
            ..good.clone()
        };
        let ftp = RecordFields {
            url: Some("ftp://acme.io/file".into()),
            ..good.clone()
        };
        let items = build_items("test", ContentKind::Project, fetched_at(), vec![good, no_url, ftp]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url_key(), "https://acme.io");
        assert_eq!(items[0].kind(), ContentKind::Project);
    }
}
