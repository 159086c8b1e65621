//! # Record Repository
//!
//! SQL over the shared `records` table, scoped to one borrowed connection so
//! the same primitives serve both plain reads (a pooled connection) and the
//! reconciler's transaction.
//!
//! ## Filter Translation
//! ```text
//! Filter::eq("account_id", 42)          json_extract(body, ?) = ?
//! Filter::eq("closed_at", Null)         json_extract(body, ?) IS NULL
//! Filter::any_of("status", [..])        json_extract(body, ?) IN (?, ?)
//! Filter::keys([1, 2])                  primary_key IN (?, ?)
//! And / Or                              ( .. AND .. ) / ( .. OR .. )
//! ```
//!
//! Field paths are validated and bound as parameters; nothing from a filter
//! is ever spliced into the SQL text.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::debug;

use finsync_core::query::json_path;
use finsync_core::{Filter, PrimaryKey, QuerySpec, ScalarValue, Sort, SortField};

use crate::error::{DbError, DbResult};
use crate::repository::links::LinkRepository;

// =============================================================================
// Stored Record
// =============================================================================

/// One row of the `records` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct StoredRecord {
    pub primary_key: PrimaryKey,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Parses the body as generic JSON.
    pub fn value(&self) -> DbResult<serde_json::Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Parses the body as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> DbResult<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            DbError::Serialization(format!("record {}: {}", self.primary_key, e))
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Record primitives over a borrowed connection.
pub struct RecordRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> RecordRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        RecordRepository { conn }
    }

    /// Fetches records of `entity_type` matching `spec`.
    pub async fn fetch(&mut self, entity_type: &str, spec: &QuerySpec) -> DbResult<Vec<StoredRecord>> {
        spec.validate()?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT primary_key, body, updated_at FROM records WHERE entity_type = ",
        );
        qb.push_bind(entity_type.to_string());
        qb.push(" AND ");
        push_filter(&mut qb, &spec.filter);
        push_sort(&mut qb, &spec.sort);

        if let Some(limit) = spec.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::from(limit));
        }

        let rows = qb
            .build_query_as::<StoredRecord>()
            .fetch_all(&mut *self.conn)
            .await?;

        debug!(entity_type, rows = rows.len(), "Fetched records");
        Ok(rows)
    }

    /// Fetches one record by key.
    pub async fn fetch_one(
        &mut self,
        entity_type: &str,
        key: PrimaryKey,
    ) -> DbResult<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT primary_key, body, updated_at
            FROM records
            WHERE entity_type = ?1 AND primary_key = ?2
            "#,
        )
        .bind(entity_type)
        .bind(key)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(row)
    }

    /// Counts records of `entity_type` matching `filter`.
    pub async fn count(&mut self, entity_type: &str, filter: &Filter) -> DbResult<i64> {
        filter.validate()?;

        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM records WHERE entity_type = ");
        qb.push_bind(entity_type.to_string());
        qb.push(" AND ");
        push_filter(&mut qb, filter);

        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count)
    }

    /// Inserts or replaces the body of one record.
    pub async fn upsert(
        &mut self,
        entity_type: &str,
        key: PrimaryKey,
        body: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO records (entity_type, primary_key, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity_type, primary_key) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity_type)
        .bind(key)
        .bind(body)
        .bind(now)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Deletes one record and every relationship link it takes part in.
    ///
    /// Returns false if the record did not exist.
    pub async fn delete(&mut self, entity_type: &str, key: PrimaryKey) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE entity_type = ?1 AND primary_key = ?2")
            .bind(entity_type)
            .bind(key)
            .execute(&mut *self.conn)
            .await?;

        LinkRepository::new(&mut *self.conn)
            .purge(entity_type, key)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records of `child_type` attached to one parent, key ascending.
    pub async fn fetch_children(
        &mut self,
        parent_type: &str,
        parent_key: PrimaryKey,
        child_type: &str,
    ) -> DbResult<Vec<StoredRecord>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT r.primary_key, r.body, r.updated_at
            FROM record_links l
            JOIN records r
              ON r.entity_type = l.child_type AND r.primary_key = l.child_key
            WHERE l.parent_type = ?1 AND l.parent_key = ?2 AND l.child_type = ?3
            ORDER BY r.primary_key ASC
            "#,
        )
        .bind(parent_type)
        .bind(parent_key)
        .bind(child_type)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows)
    }
}

// =============================================================================
// SQL Builders
// =============================================================================

fn push_extract(qb: &mut QueryBuilder<'_, Sqlite>, field: &str) {
    qb.push("json_extract(body, ");
    qb.push_bind(json_path(field));
    qb.push(")");
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &ScalarValue) {
    match value {
        ScalarValue::Null => {
            qb.push("NULL");
        }
        ScalarValue::Bool(b) => {
            qb.push_bind(*b);
        }
        ScalarValue::Int(i) => {
            qb.push_bind(*i);
        }
        ScalarValue::Real(r) => {
            qb.push_bind(*r);
        }
        ScalarValue::Text(s) => {
            qb.push_bind(s.clone());
        }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("1 = 1");
        }

        Filter::FieldEq {
            field,
            value: ScalarValue::Null,
        } => {
            push_extract(qb, field);
            qb.push(" IS NULL");
        }

        Filter::FieldEq { field, value } => {
            push_extract(qb, field);
            qb.push(" = ");
            push_value(qb, value);
        }

        Filter::FieldIn { field, values } => {
            let matches_null = values.iter().any(|v| matches!(v, ScalarValue::Null));
            let non_null: Vec<&ScalarValue> = values
                .iter()
                .filter(|v| !matches!(v, ScalarValue::Null))
                .collect();

            if non_null.is_empty() && !matches_null {
                qb.push("0 = 1");
                return;
            }

            qb.push("(");
            if !non_null.is_empty() {
                push_extract(qb, field);
                qb.push(" IN (");
                for (i, value) in non_null.into_iter().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    push_value(qb, value);
                }
                qb.push(")");
                if matches_null {
                    qb.push(" OR ");
                }
            }
            if matches_null {
                push_extract(qb, field);
                qb.push(" IS NULL");
            }
            qb.push(")");
        }

        Filter::KeyIn { keys } => {
            if keys.is_empty() {
                qb.push("0 = 1");
                return;
            }
            qb.push("primary_key IN (");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push_bind(*key);
            }
            qb.push(")");
        }

        Filter::And { filters } => push_group(qb, filters, " AND ", "1 = 1"),

        Filter::Or { filters } => push_group(qb, filters, " OR ", "0 = 1"),
    }
}

fn push_group(qb: &mut QueryBuilder<'_, Sqlite>, filters: &[Filter], joiner: &str, empty: &str) {
    if filters.is_empty() {
        qb.push(empty);
        return;
    }

    qb.push("(");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        push_filter(qb, filter);
    }
    qb.push(")");
}

fn push_sort(qb: &mut QueryBuilder<'_, Sqlite>, sort: &Sort) {
    let direction = if sort.ascending { "ASC" } else { "DESC" };

    match &sort.field {
        SortField::PrimaryKey => {
            qb.push(" ORDER BY primary_key ");
            qb.push(direction);
        }
        SortField::Field(field) => {
            qb.push(" ORDER BY ");
            push_extract(qb, field);
            qb.push(" ");
            qb.push(direction);
            qb.push(", primary_key ASC");
        }
    }
}
