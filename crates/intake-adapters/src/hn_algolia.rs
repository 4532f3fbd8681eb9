use async_trait::async_trait;
use intake_core::{parse_timestamp, ContentItem, ContentKind, Metadata};
use intake_storage::HttpFetcher;
use serde_json::Value as JsonValue;

use crate::text::{json_str, json_string_vec, json_u64, strip_html, text_or_none};
use crate::{
    build_items, check_source, fetch_source_payload, AdapterContext, AdapterError, RawPayload,
    RecordFields, SourceAdapter, SourceConfig, SourceFormat,
};

const DISCUSSION_BASE: &str = "https://news.ycombinator.com/item?id=";
const TITLE_PREFIXES: &[&str] = &["show hn:", "launch hn:"];

/// Hacker News stories from the Algolia search API (`hits[]`).
#[derive(Debug, Clone)]
pub struct HnAlgoliaAdapter {
    config: SourceConfig,
}

impl HnAlgoliaAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

fn clean_title(title: &str) -> String {
    let lower = title.to_ascii_lowercase();
    TITLE_PREFIXES
        .iter()
        .find(|prefix| lower.starts_with(*prefix))
        .map(|prefix| title[prefix.len()..].trim().to_string())
        .unwrap_or_else(|| title.trim().to_string())
}

fn synthesized_description(author: Option<&str>, points: Option<u64>, comments: Option<u64>) -> String {
    let by = author.map(|a| format!(" by {a}")).unwrap_or_default();
    format!(
        "Posted to Hacker News{by} ({} points, {} comments).",
        points.unwrap_or(0),
        comments.unwrap_or(0)
    )
}

fn record_from_hit(hit: &JsonValue) -> RecordFields {
    let object_id = json_str(hit, &["objectID"]);
    let discussion_url = object_id.map(|id| format!("{DISCUSSION_BASE}{id}"));
    let author = json_str(hit, &["author"]).map(str::to_string);
    let points = json_u64(hit, &["points"]);
    let comments = json_u64(hit, &["num_comments"]);

    let title = json_str(hit, &["title"])
        .or_else(|| json_str(hit, &["story_title"]))
        .map(clean_title);
    let url = json_str(hit, &["url"])
        .map(str::to_string)
        .or_else(|| discussion_url.clone());
    let description = json_str(hit, &["story_text"])
        .map(strip_html)
        .and_then(text_or_none)
        .or_else(|| title.as_ref().map(|_| synthesized_description(author.as_deref(), points, comments)));
    let tags = json_string_vec(hit, &["_tags"])
        .into_iter()
        .filter(|t| t != "story" && !t.starts_with("author_") && !t.starts_with("story_"))
        .collect();

    let mut metadata = Metadata::new();
    if let Some(id) = object_id {
        metadata.insert("hn_id", id);
    }
    metadata.insert("points", points);
    metadata.insert("comments", comments);
    metadata.insert("discussion_url", discussion_url.clone());

    RecordFields {
        title,
        url,
        description,
        author,
        published_at: json_str(hit, &["created_at"]).and_then(parse_timestamp),
        engagement: points,
        tags,
        links: discussion_url.into_iter().collect(),
        metadata,
        ..Default::default()
    }
}

#[async_trait]
impl SourceAdapter for HnAlgoliaAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> ContentKind {
        self.config.kind
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::HnAlgolia
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawPayload>, AdapterError> {
        Ok(vec![fetch_source_payload(&self.config, http, ctx, &[]).await?])
    }

    fn transform(&self, raw: &RawPayload) -> Result<Vec<ContentItem>, AdapterError> {
        check_source(&self.config, raw)?;
        let doc = raw.json()?;
        let hits = doc
            .get("hits")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| raw.parse_error("missing hits array"))?;
        let records = hits.iter().map(record_from_hit).collect();
        Ok(build_items(&self.config.source_id, self.config.kind, raw.fetched_at, records))
    }
}
