//! `sources.yaml` registry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use intake_core::ContentKind;
use intake_storage::RateLimit;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    HnAlgolia,
    GithubSearch,
    JsonFeed,
    HtmlListing,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::HnAlgolia => "hn_algolia",
            SourceFormat::GithubSearch => "github_search",
            SourceFormat::JsonFeed => "json_feed",
            SourceFormat::HtmlListing => "html_listing",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SourceFormat::HtmlListing => "html",
            _ => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

/// CSS selectors for `html_listing` sources. Defaults fit a funding program
/// directory made of `.program` cards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlSelectors {
    pub item: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub amount: String,
    pub date: String,
    pub organization: String,
    pub eligibility: String,
    pub tags: String,
}

impl Default for HtmlSelectors {
    fn default() -> Self {
        Self {
            item: ".program".into(),
            title: "h2, h3".into(),
            link: "a[href]".into(),
            description: ".description, p".into(),
            amount: ".amount".into(),
            date: ".deadline".into(),
            organization: ".organization".into(),
            eligibility: ".eligibility".into(),
            tags: ".tag".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub kind: ContentKind,
    pub format: SourceFormat,
    #[serde(default)]
    pub mode: SourceMode,
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub selectors: Option<HtmlSelectors>,
    /// Raw payload read in fixture mode, relative to the workspace root.
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    /// Token bucket for live requests to this source.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
            if source.mode == SourceMode::Fixture && source.fixture_path.is_none() {
                bail!("source {} is in fixture mode without fixture_path", source.source_id);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// Rate limits of enabled sources that declare one, keyed by source id.
    pub fn rate_limits(&self) -> HashMap<String, RateLimit> {
        self.enabled()
            .filter_map(|s| s.rate_limit.map(|limit| (s.source_id.clone(), limit)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
sources:
  - source_id: hn-show
    display_name: Show HN
    kind: project
    format: hn_algolia
    endpoint: https://hn.algolia.com/api/v1/search_by_date?tags=show_hn
    rate_limit: {burst: 2, per_second: 0.5}
  - source_id: dev-news
    display_name: Dev News
    enabled: false
    kind: news
    format: json_feed
    mode: fixture
    endpoint: https://devnews.example/feed.json
    fixture_path: fixtures/dev-news/sample/raw.json
  - source_id: grants
    display_name: Grants Directory
    kind: funding
    format: html_listing
    endpoint: https://grants.example/programs
    selectors:
      item: .card
"#;

    #[test]
    fn registry_parses_defaults_and_aliases() {
        let registry = SourceRegistry::from_yaml_str(YAML).unwrap();
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.enabled().count(), 2);

        let hn = registry.get("hn-show").unwrap();
        assert_eq!(hn.mode, SourceMode::Live);
        assert!(hn.enabled);

        let news = registry.get("dev-news").unwrap();
        assert_eq!(news.kind, ContentKind::Resource);
        assert_eq!(news.mode, SourceMode::Fixture);

        assert_eq!(
            hn.rate_limit,
            Some(RateLimit {
                burst: 2,
                per_second: 0.5
            })
        );
        assert_eq!(registry.rate_limits().len(), 1);
        assert!(registry.get("grants").unwrap().rate_limit.is_none());

        let selectors = registry.get("grants").unwrap().selectors.clone().unwrap();
        assert_eq!(selectors.item, ".card");
        assert_eq!(selectors.amount, ".amount");
    }

    #[test]
    fn registry_rejects_duplicates_and_fixture_without_path() {
        let duplicate = r#"
sources:
  - {source_id: a, display_name: A, kind: project, format: hn_algolia, endpoint: "https://a.example"}
  - {source_id: a, display_name: A2, kind: project, format: hn_algolia, endpoint: "https://a.example"}
"#;
        assert!(SourceRegistry::from_yaml_str(duplicate).is_err());

        let no_path = r#"
sources:
  - {source_id: a, display_name: A, kind: project, format: hn_algolia, mode: fixture, endpoint: "https://a.example"}
"#;
        assert!(SourceRegistry::from_yaml_str(no_path).is_err());
    }
}
