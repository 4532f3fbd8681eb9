//! Duplicate detection against everything already queued or promoted.
//!
//! Exact matches compare `url_key`s through the store. Fuzzy matches compare
//! normalized title and description against an in-process index of the kind's
//! queue and production rows. The index is a cache: the `url_key` unique
//! constraint in storage is what actually keeps duplicates out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use intake_core::{parse_timestamp, ContentItem, ContentKind, Row};
use intake_storage::{DataStore, Filter, StoreError};
use strsim::{normalized_levenshtein, sorensen_dice};
use tokio::sync::Mutex;
use tracing::debug;

const INDEX_COLUMNS: &[&str] = &["url_key", "title", "description", "fetched_at", "created_at"];

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub fuzzy_threshold: f64,
    pub title_weight: f64,
    pub description_weight: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            title_weight: 0.7,
            description_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    ExactUrl { url_key: String },
    Fuzzy { url_key: String, similarity: f64 },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupVerdict::Unique)
    }
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
struct IndexEntry {
    url_key: String,
    title: String,
    description: String,
    seen_at: Option<DateTime<Utc>>,
}

/// Normalized title/description of known records for one content kind.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    entries: Vec<IndexEntry>,
}

impl DedupIndex {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Self {
        let mut index = Self::default();
        for row in rows {
            let text = |col: &str| row.get(col).and_then(|v| v.as_str()).unwrap_or_default();
            let seen_at = ["fetched_at", "created_at"]
                .iter()
                .find_map(|col| row.get(*col).and_then(|v| v.as_str()).and_then(parse_timestamp));
            if text("url_key").is_empty() {
                continue;
            }
            index.push(text("url_key"), text("title"), text("description"), seen_at);
        }
        index
    }

    pub fn push(&mut self, url_key: &str, title: &str, description: &str, seen_at: Option<DateTime<Utc>>) {
        self.entries.push(IndexEntry {
            url_key: url_key.to_string(),
            title: normalize_text(title),
            description: normalize_text(description),
            seen_at,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn url_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.url_key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most similar entry at or above the threshold. Ties go to the most recently seen entry.
    pub fn best_match(&self, title: &str, description: &str, config: &DedupConfig) -> Option<(String, f64)> {
        let title = normalize_text(title);
        let description = normalize_text(description);
        self.entries
            .iter()
            .map(|entry| {
                let similarity = config.title_weight * normalized_levenshtein(&title, &entry.title)
                    + config.description_weight * sorensen_dice(&description, &entry.description);
                (entry, similarity)
            })
            .filter(|(_, similarity)| *similarity >= config.fuzzy_threshold)
            .max_by(|(a, sa), (b, sb)| sa.total_cmp(sb).then_with(|| a.seen_at.cmp(&b.seen_at)))
            .map(|(entry, similarity)| (entry.url_key.clone(), similarity))
    }
}

pub struct DedupFilter {
    store: Arc<dyn DataStore>,
    config: DedupConfig,
    indexes: Mutex<HashMap<ContentKind, DedupIndex>>,
}

impl DedupFilter {
    pub fn new(store: Arc<dyn DataStore>, config: DedupConfig) -> Self {
        Self {
            store,
            config,
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// (Re)loads the fuzzy index for `kind` from its queue and production relations.
    pub async fn prepare(&self, kind: ContentKind) -> Result<usize, StoreError> {
        let mut rows = self
            .store
            .select(kind.queue_table(), &Filter::all(), INDEX_COLUMNS)
            .await?;
        rows.extend(
            self.store
                .select(
                    kind.production_table(),
                    &Filter::all(),
                    &["url_key", "title", "description", "approved_at"],
                )
                .await?
                .into_iter()
                .map(|mut row| {
                    if let Some(at) = row.remove("approved_at") {
                        row.insert("created_at".into(), at);
                    }
                    row
                }),
        );
        let index = DedupIndex::from_rows(&rows);
        let size = index.len();
        self.indexes.lock().await.insert(kind, index);
        debug!(kind = %kind, size, "dedup index loaded");
        Ok(size)
    }

    /// `url_key`s in the loaded index for `kind`; empty until [`DedupFilter::prepare`] ran.
    pub async fn known_url_keys(&self, kind: ContentKind) -> HashSet<String> {
        self.indexes
            .lock()
            .await
            .get(&kind)
            .map(|index| index.url_keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    async fn exact_match(&self, item: &ContentItem) -> Result<bool, StoreError> {
        let kind = item.kind();
        for table in [kind.queue_table(), kind.production_table()] {
            let hits = self
                .store
                .select(table, &Filter::all().eq("url_key", item.url_key()), &["url_key"])
                .await?;
            if !hits.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn check(&self, item: &ContentItem) -> Result<DedupVerdict, StoreError> {
        if self.exact_match(item).await? {
            return Ok(DedupVerdict::ExactUrl {
                url_key: item.url_key().to_string(),
            });
        }

        let kind = item.kind();
        let loaded = self.indexes.lock().await.contains_key(&kind);
        if !loaded {
            self.prepare(kind).await?;
        }
        let indexes = self.indexes.lock().await;
        let best = indexes
            .get(&kind)
            .and_then(|index| index.best_match(item.title(), item.description(), &self.config));
        Ok(match best {
            Some((url_key, similarity)) => DedupVerdict::Fuzzy { url_key, similarity },
            None => DedupVerdict::Unique,
        })
    }

    pub async fn is_duplicate(&self, item: &ContentItem) -> Result<bool, StoreError> {
        Ok(self.check(item).await?.is_duplicate())
    }

    /// Adds a freshly stored item so later items in the same run are compared against it.
    pub async fn record(&self, item: &ContentItem) {
        self.indexes
            .lock()
            .await
            .entry(item.kind())
            .or_default()
            .push(item.url_key(), item.title(), item.description(), Some(item.fetched_at()));
    }
}
