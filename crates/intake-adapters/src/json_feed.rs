use async_trait::async_trait;
use intake_core::{parse_timestamp, ContentItem, ContentKind, Metadata};
use intake_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::text::{json_str, json_string_vec, parse_amount_range, parse_loose_date, strip_html, text_or_none};
use crate::{
    build_items, check_source, fetch_source_payload, AdapterContext, AdapterError, RawPayload,
    RecordFields, SourceAdapter, SourceConfig, SourceFormat,
};

/// JSON Feed 1.x documents (`items[]`).
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    config: SourceConfig,
}

impl JsonFeedAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

/// `_intake` item extension carrying facts a plain feed item has no field for.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IntakeExtension {
    team_size: Option<u32>,
    traction: Option<u64>,
    social_links: Vec<String>,
    organization: Option<String>,
    amount: Option<String>,
    deadline: Option<String>,
    eligibility: Option<String>,
    apply_url: Option<String>,
}

fn extension(item: &JsonValue) -> IntakeExtension {
    let Some(value) = item.get("_intake") else {
        return IntakeExtension::default();
    };
    serde_json::from_value(value.clone()).unwrap_or_else(|err| {
        debug!(error = %err, "ignoring malformed _intake extension");
        IntakeExtension::default()
    })
}

fn record_from_item(item: &JsonValue, feed_title: Option<&str>) -> RecordFields {
    let url = json_str(item, &["url"])
        .or_else(|| json_str(item, &["external_url"]))
        .or_else(|| json_str(item, &["id"]).filter(|id| id.starts_with("http")))
        .map(str::to_string);
    let description = json_str(item, &["summary"])
        .map(str::to_string)
        .or_else(|| json_str(item, &["content_text"]).map(str::to_string))
        .or_else(|| json_str(item, &["content_html"]).map(strip_html))
        .and_then(text_or_none);
    let author = item
        .get("authors")
        .and_then(JsonValue::as_array)
        .and_then(|authors| authors.iter().find_map(|a| json_str(a, &["name"])))
        .or_else(|| json_str(item, &["author", "name"]))
        .map(str::to_string);
    let ext = extension(item);

    let mut metadata = Metadata::new();
    metadata.insert("feed_item_id", json_str(item, &["id"]));
    metadata.insert("feed_title", feed_title);
    metadata.insert("image", json_str(item, &["image"]));
    if let Some(amount) = &ext.amount {
        metadata.insert("amount_text", amount.as_str());
    }

    RecordFields {
        title: json_str(item, &["title"]).map(str::to_string),
        url,
        description,
        author,
        published_at: json_str(item, &["date_published"])
            .or_else(|| json_str(item, &["date_modified"]))
            .and_then(parse_timestamp),
        engagement: ext.traction,
        tags: json_string_vec(item, &["tags"]),
        links: ext.social_links,
        team_size: ext.team_size,
        amount: ext.amount.as_deref().map(parse_amount_range).unwrap_or_default(),
        deadline: ext.deadline.as_deref().and_then(parse_loose_date),
        eligibility: ext.eligibility,
        organization: ext.organization,
        apply_url: ext.apply_url,
        metadata,
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> ContentKind {
        self.config.kind
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::JsonFeed
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawPayload>, AdapterError> {
        let headers = [("accept", "application/feed+json, application/json".to_string())];
        Ok(vec![fetch_source_payload(&self.config, http, ctx, &headers).await?])
    }

    fn transform(&self, raw: &RawPayload) -> Result<Vec<ContentItem>, AdapterError> {
        check_source(&self.config, raw)?;
        let doc = raw.json()?;
        if !json_str(&doc, &["version"]).is_some_and(|v| v.starts_with("https://jsonfeed.org/version/")) {
            return Err(raw.parse_error("not a JSON Feed document"));
        }
        let items = doc
            .get("items")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| raw.parse_error("missing items array"))?;
        let feed_title = json_str(&doc, &["title"]);
        let records = items.iter().map(|item| record_from_item(item, feed_title)).collect();
        Ok(build_items(&self.config.source_id, self.config.kind, raw.fetched_at, records))
    }
}
