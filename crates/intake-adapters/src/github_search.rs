use async_trait::async_trait;
use intake_core::{parse_timestamp, ContentItem, ContentKind, Metadata};
use intake_storage::HttpFetcher;
use serde_json::Value as JsonValue;

use crate::text::{json_str, json_string_vec, json_u64};
use crate::{
    build_items, check_source, fetch_source_payload, AdapterContext, AdapterError, RawPayload,
    RecordFields, SourceAdapter, SourceConfig, SourceFormat,
};

/// Repositories from the GitHub search API (`items[]`).
#[derive(Debug, Clone)]
pub struct GithubSearchAdapter {
    config: SourceConfig,
}

impl GithubSearchAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

fn record_from_repo(repo: &JsonValue) -> RecordFields {
    let stars = json_u64(repo, &["stargazers_count"]);
    let links = [json_str(repo, &["homepage"]), json_str(repo, &["owner", "html_url"])]
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();

    let mut metadata = Metadata::new();
    metadata.insert("full_name", json_str(repo, &["full_name"]));
    metadata.insert("stars", stars);
    metadata.insert("forks", json_u64(repo, &["forks_count"]));
    metadata.insert("open_issues", json_u64(repo, &["open_issues_count"]));
    metadata.insert("language", json_str(repo, &["language"]));
    metadata.insert("pushed_at", json_str(repo, &["pushed_at"]));

    RecordFields {
        title: json_str(repo, &["name"])
            .or_else(|| json_str(repo, &["full_name"]))
            .map(str::to_string),
        url: json_str(repo, &["html_url"]).map(str::to_string),
        description: json_str(repo, &["description"]).map(str::to_string),
        author: json_str(repo, &["owner", "login"]).map(str::to_string),
        published_at: json_str(repo, &["created_at"]).and_then(parse_timestamp),
        engagement: stars,
        tags: json_string_vec(repo, &["topics"]),
        links,
        metadata,
        ..Default::default()
    }
}

#[async_trait]
impl SourceAdapter for GithubSearchAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> ContentKind {
        self.config.kind
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::GithubSearch
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawPayload>, AdapterError> {
        let headers = [
            ("accept", "application/vnd.github+json".to_string()),
            ("x-github-api-version", "2022-11-28".to_string()),
        ];
        Ok(vec![fetch_source_payload(&self.config, http, ctx, &headers).await?])
    }

    fn transform(&self, raw: &RawPayload) -> Result<Vec<ContentItem>, AdapterError> {
        check_source(&self.config, raw)?;
        let doc = raw.json()?;
        let repos = doc
            .get("items")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| raw.parse_error("missing items array"))?;
        let records = repos.iter().map(record_from_repo).collect();
        Ok(build_items(&self.config.source_id, self.config.kind, raw.fetched_at, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_fields_map_to_record() {
        let repo = serde_json::json!({
            "name": "ledgerly",
            "full_name": "ledgerly/ledgerly",
            "html_url": "https://github.com/ledgerly/ledgerly",
            "description": "Double-entry bookkeeping API",
            "stargazers_count": 840,
            "forks_count": 31,
            "topics": ["accounting", "api"],
            "homepage": "",
            "owner": {"login": "ledgerly", "html_url": "https://github.com/ledgerly"},
            "created_at": "2025-11-02T08:00:00Z"
        });
        let record = record_from_repo(&repo);
        assert_eq!(record.title.as_deref(), Some("ledgerly"));
        assert_eq!(record.engagement, Some(840));
        assert_eq!(record.links, vec!["https://github.com/ledgerly".to_string()]);
        assert_eq!(record.tags.len(), 2);
        assert_eq!(record.metadata.i64("forks"), Some(31));
        assert!(record.metadata.get("language").is_none());
    }
}
