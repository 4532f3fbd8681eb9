use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row as _};
use tracing::debug;

use crate::store::value_text;
use crate::{Condition, DataStore, Filter, Row, StoreError};

/// [`DataStore`] over a Postgres pool. Rows travel as `jsonb`: reads go through
/// `to_jsonb`, writes through `jsonb_populate_record` so column types come from
/// the relation itself.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|err| map_sqlx_error("<connect>", err))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn quote_ident(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(format!("\"{name}\""))
    } else {
        Err(StoreError::Invalid(format!("invalid identifier {name:?}")))
    }
}

fn push_where(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<(), StoreError> {
    for (idx, condition) in filter.conditions().iter().enumerate() {
        builder.push(if idx == 0 { " WHERE " } else { " AND " });
        match condition {
            Condition::Eq(column, value) => {
                let column = quote_ident(column)?;
                match value_text(value) {
                    Some(text) => {
                        builder.push(format!("t.{column}::text = "));
                        builder.push_bind(text);
                    }
                    None => {
                        builder.push(format!("t.{column} IS NULL"));
                    }
                }
            }
            Condition::In(column, values) => {
                let column = quote_ident(column)?;
                let texts = values.iter().filter_map(value_text).collect::<Vec<_>>();
                builder.push(format!("t.{column}::text = ANY("));
                builder.push_bind(texts);
                builder.push(")");
            }
        }
    }
    Ok(())
}

fn column_list(record: &Row) -> Result<Vec<String>, StoreError> {
    if record.is_empty() {
        return Err(StoreError::Invalid("empty row".to_string()));
    }
    record.keys().map(|k| quote_ident(k)).collect()
}

fn select_query<'a>(
    table: &str,
    filter: &Filter,
    projection: &[&str],
) -> Result<QueryBuilder<'a, Postgres>, StoreError> {
    let relation = quote_ident(table)?;
    let mut builder = QueryBuilder::new("SELECT ");
    if projection.is_empty() {
        builder.push("to_jsonb(t)");
    } else {
        let pairs = projection
            .iter()
            .map(|column| Ok(format!("'{column}', t.{}", quote_ident(column)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        builder.push(format!("jsonb_build_object({})", pairs.join(", ")));
    }
    builder.push(format!(" AS row FROM {relation} AS t"));
    push_where(&mut builder, filter)?;
    Ok(builder)
}

fn insert_query<'a>(table: &str, record: Row) -> Result<QueryBuilder<'a, Postgres>, StoreError> {
    let relation = quote_ident(table)?;
    let columns = column_list(&record)?.join(", ");
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {relation} AS t ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{relation}, "
    ));
    builder.push_bind(JsonValue::Object(record));
    builder.push(") RETURNING to_jsonb(t) AS row");
    Ok(builder)
}

fn update_query<'a>(
    table: &str,
    filter: &Filter,
    patch: Row,
) -> Result<QueryBuilder<'a, Postgres>, StoreError> {
    let relation = quote_ident(table)?;
    let columns = column_list(&patch)?;
    let target = if columns.len() == 1 {
        columns[0].clone()
    } else {
        format!("({})", columns.join(", "))
    };
    let mut builder = QueryBuilder::new(format!(
        "UPDATE {relation} AS t SET {target} = (SELECT {} FROM jsonb_populate_record(NULL::{relation}, ",
        columns.join(", ")
    ));
    builder.push_bind(JsonValue::Object(patch));
    builder.push("))");
    push_where(&mut builder, filter)?;
    builder.push(" RETURNING to_jsonb(t) AS row");
    Ok(builder)
}

fn delete_query<'a>(table: &str, filter: &Filter) -> Result<QueryBuilder<'a, Postgres>, StoreError> {
    let relation = quote_ident(table)?;
    let mut builder = QueryBuilder::new(format!("DELETE FROM {relation} AS t"));
    push_where(&mut builder, filter)?;
    Ok(builder)
}

fn decode_row(table: &str, row: &sqlx::postgres::PgRow) -> Result<Row, StoreError> {
    let value: JsonValue = row.try_get("row").map_err(|err| map_sqlx_error(table, err))?;
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(StoreError::Backend(format!("{table} returned non-object row {other}"))),
    }
}

pub(crate) fn map_sqlx_error(table: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("42P01") => StoreError::RelationMissing {
                    table: table.to_string(),
                },
                Some("23505") => StoreError::UniqueViolation {
                    table: table.to_string(),
                    detail: db.constraint().map(str::to_string).unwrap_or(message),
                },
                Some("42703") | Some("22P02") | Some("23502") => StoreError::Invalid(message),
                _ => StoreError::Backend(message),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl DataStore for PgStore {
    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        projection: &[&str],
    ) -> Result<Vec<Row>, StoreError> {
        let mut builder = select_query(table, filter, projection)?;
        debug!(table, sql = builder.sql(), "store select");
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(table, err))?;
        rows.iter().map(|row| decode_row(table, row)).collect()
    }

    async fn insert(&self, table: &str, record: Row) -> Result<Row, StoreError> {
        let mut builder = insert_query(table, record)?;
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(table, err))?;
        decode_row(table, &row)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<Vec<Row>, StoreError> {
        let mut builder = update_query(table, filter, patch)?;
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(table, err))?;
        rows.iter().map(|row| decode_row(table, row)).collect()
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut builder = delete_query(table, filter)?;
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(table, err))?;
        Ok(result.rows_affected())
    }
}
