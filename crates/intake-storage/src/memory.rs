use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use intake_core::ContentKind;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::value_text;
use crate::{DataStore, Filter, Row, StoreError};

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub unique: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, unique: &[&str]) -> Self {
        Self {
            name: name.into(),
            unique: unique.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    unique: Vec<String>,
    rows: Vec<Row>,
}

impl MemoryTable {
    /// First unique column on which `candidate` collides with a row other than `skip`.
    fn conflict(&self, candidate: &Row, skip: Option<usize>) -> Option<String> {
        self.unique.iter().find_map(|column| {
            let value = value_text(candidate.get(column)?)?;
            self.rows
                .iter()
                .enumerate()
                .filter(|(idx, _)| Some(*idx) != skip)
                .any(|(_, row)| row.get(column).and_then(value_text).as_deref() == Some(value.as_str()))
                .then(|| format!("duplicate value for {column}: {value}"))
        })
    }
}

/// In-process store with schema awareness and unique constraints. Unknown
/// relations fail with [`StoreError::RelationMissing`] like a real database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new(specs: impl IntoIterator<Item = TableSpec>) -> Self {
        let tables = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.name,
                    MemoryTable {
                        unique: spec.unique,
                        rows: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Queue and production relations for every content kind, unique on `id` and `url_key`.
    pub fn with_intake_schema() -> Self {
        Self::new(ContentKind::ALL.into_iter().flat_map(|kind| {
            [kind.queue_table(), kind.production_table()]
                .map(|table| TableSpec::new(table, &["id", "url_key"]))
        }))
    }
}

fn project(row: &Row, projection: &[&str]) -> Row {
    if projection.is_empty() {
        return row.clone();
    }
    projection
        .iter()
        .map(|column| {
            (
                column.to_string(),
                row.get(*column).cloned().unwrap_or(JsonValue::Null),
            )
        })
        .collect()
}

fn missing(table: &str) -> StoreError {
    StoreError::RelationMissing {
        table: table.to_string(),
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.lock().await;
        let data = tables.get(table).ok_or_else(|| missing(table))?;
        Ok(data
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .map(|row| project(row, projection))
            .collect())
    }

    async fn insert(&self, table: &str, mut record: Row) -> Result<Row, StoreError> {
        let mut tables = self.tables.lock().await;
        let data = tables.get_mut(table).ok_or_else(|| missing(table))?;

        let now = json!(Utc::now());
        for (column, default) in [
            ("id", json!(Uuid::new_v4())),
            ("created_at", now.clone()),
            ("updated_at", now),
        ] {
            if record.get(column).map_or(true, JsonValue::is_null) {
                record.insert(column.to_string(), default);
            }
        }

        if let Some(detail) = data.conflict(&record, None) {
            return Err(StoreError::UniqueViolation {
                table: table.to_string(),
                detail,
            });
        }
        data.rows.push(record.clone());
        Ok(record)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.lock().await;
        let data = tables.get_mut(table).ok_or_else(|| missing(table))?;

        let targets = data
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| filter.matches(row))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();

        let mut updated = Vec::with_capacity(targets.len());
        for idx in &targets {
            let mut candidate = data.rows[*idx].clone();
            candidate.extend(patch.clone());
            if let Some(detail) = data.conflict(&candidate, Some(*idx)) {
                return Err(StoreError::UniqueViolation {
                    table: table.to_string(),
                    detail,
                });
            }
            updated.push(candidate);
        }
        for (idx, row) in targets.into_iter().zip(updated.iter()) {
            data.rows[idx] = row.clone();
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let data = tables.get_mut(table).ok_or_else(|| missing(table))?;
        let before = data.rows.len();
        data.rows.retain(|row| !filter.matches(row));
        Ok((before - data.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[tokio::test]
    async fn insert_generates_identity_and_enforces_unique_columns() {
        let store = MemoryStore::with_intake_schema();
        let first = store
            .insert("queue_projects", row(json!({"url_key": "https://acme.io", "title": "Acme"})))
            .await
            .unwrap();
        assert!(first.get("id").and_then(JsonValue::as_str).is_some());
        assert!(first.contains_key("created_at"));

        let err = store
            .insert("queue_projects", row(json!({"url_key": "https://acme.io", "title": "Acme 2"})))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        // Uniqueness is per relation.
        store
            .insert("projects", row(json!({"url_key": "https://acme.io"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_relation_is_reported_as_missing() {
        let store = MemoryStore::with_intake_schema();
        let err = store
            .select("queue_news", &Filter::all(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RelationMissing { ref table } if table == "queue_news"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn update_select_and_delete_follow_filters() {
        let store = MemoryStore::with_intake_schema();
        let inserted = store
            .insert(
                "queue_resources",
                row(json!({"url_key": "https://a.dev/post", "status": "pending_review"})),
            )
            .await
            .unwrap();
        let id = inserted["id"].clone();

        let updated = store
            .update(
                "queue_resources",
                &Filter::all().eq("id", id.clone()).eq("status", "pending_review"),
                row(json!({"status": "approved"})),
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);

        let again = store
            .update(
                "queue_resources",
                &Filter::all().eq("id", id.clone()).eq("status", "pending_review"),
                row(json!({"status": "rejected"})),
            )
            .await
            .unwrap();
        assert!(again.is_empty());

        let rows = store
            .select("queue_resources", &Filter::all().eq("id", id.clone()), &["status"])
            .await
            .unwrap();
        assert_eq!(rows, vec![row(json!({"status": "approved"}))]);

        let removed = store
            .delete("queue_resources", &Filter::all().eq("id", id))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
