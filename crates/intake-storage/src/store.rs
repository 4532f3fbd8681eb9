use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::Row;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relation {table} does not exist")]
    RelationMissing { table: String },
    #[error("unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },
    #[error("data store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid store request: {0}")]
    Invalid(String),
    #[error("data store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Missing relations and lost connections need operator action; retrying won't help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::RelationMissing { .. } | StoreError::Unavailable(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, JsonValue),
    In(String, Vec<JsonValue>),
}

/// Conjunction of column conditions. Values compare by their text form, so a
/// uuid column matches its string rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push(Condition::Eq(column.into(), value.into()));
        self
    }

    pub fn one_of<V: Into<JsonValue>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(Condition::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(column, expected) => {
                value_text(row.get(column).unwrap_or(&JsonValue::Null)) == value_text(expected)
            }
            Condition::In(column, options) => {
                let actual = value_text(row.get(column).unwrap_or(&JsonValue::Null));
                actual.is_some() && options.iter().any(|option| value_text(option) == actual)
            }
        })
    }
}

pub(crate) fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Generic relational client the pipeline runs against.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Rows matching `filter`; an empty `projection` returns every column.
    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> Result<Vec<Row>, StoreError>;

    /// Inserts one row and returns it as stored, including generated columns.
    async fn insert(&self, table: &str, record: Row) -> Result<Row, StoreError>;

    /// Applies `patch` to every matching row and returns the updated rows.
    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError>;
}
