//! SQLite-backed [`DocumentStore`].
//!
//! The collection is one table with a typed column per schema field (see
//! [`crate::migrate`]). A [`Filter`] compiles to a parameterized `WHERE`
//! clause that gives the same answers as [`Filter::matches`]: every
//! predicate is two-valued, so `NULL` never leaks through `NOT`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::DocumentStore;
use crate::config::Config;
use crate::db;
use crate::migrate::{quote_ident, run_migrations};
use crate::models::Document;
use crate::query::eval::number_value;
use crate::query::{Condition, Filter};
use crate::schema::{CollectionSchema, Field, FieldType};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A value bound into a statement.
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Text(String),
    Real(f64),
    Null,
}

impl SqlParam {
    /// Converts a value for `field`'s column. `None` when the value's type
    /// can never equal anything stored in that column.
    fn for_field(field: &Field, value: &Value) -> Option<SqlParam> {
        match (field.ty, value) {
            (_, Value::Null) => Some(SqlParam::Null),
            (FieldType::Double, Value::Number(n)) => n.as_f64().map(SqlParam::Real),
            (FieldType::Double, _) => None,
            (_, Value::String(s)) => Some(SqlParam::Text(s.clone())),
            _ => None,
        }
    }

    fn bind<'q>(self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        match self {
            SqlParam::Text(s) => query.bind(s),
            SqlParam::Real(f) => query.bind(f),
            SqlParam::Null => query.bind(None::<String>),
        }
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
    schema: CollectionSchema,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, schema: CollectionSchema) -> Self {
        Self { pool, schema }
    }

    /// Opens the configured database and makes sure the collection exists.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store = Self::new(pool, config.collection.schema());
        store.ensure_collection().await?;
        Ok(store)
    }

    pub async fn ensure_collection(&self) -> Result<()> {
        run_migrations(&self.pool, &self.schema)
            .await
            .with_context(|| format!("Failed to create collection '{}'", self.schema.collection))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table(&self) -> String {
        quote_ident(&self.schema.collection)
    }

    fn column_list(&self) -> String {
        self.schema
            .fields
            .iter()
            .map(|f| quote_ident(f.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn where_clause(&self, filter: &Filter, params: &mut Vec<SqlParam>) -> Result<String> {
        let join = |parts: &[Filter], sep: &str, params: &mut Vec<SqlParam>| -> Result<String> {
            let sql = parts
                .iter()
                .map(|p| self.where_clause(p, params))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", sql.join(sep)))
        };
        match filter {
            Filter::All => Ok("1".to_string()),
            Filter::And(parts) if parts.is_empty() => Ok("1".to_string()),
            Filter::Or(parts) | Filter::Nor(parts) if parts.is_empty() => {
                Ok(if matches!(filter, Filter::Or(_)) { "0" } else { "1" }.to_string())
            }
            Filter::And(parts) => join(parts, " AND ", params),
            Filter::Or(parts) => join(parts, " OR ", params),
            Filter::Nor(parts) => Ok(format!("NOT {}", join(parts, " OR ", params)?)),
            Filter::Field { path, cond } => {
                let Some(field) = self.schema.field(path) else {
                    bail!("cannot filter on `{}`: not a column of '{}'", path, self.schema.collection);
                };
                Ok(condition_sql(field, cond, params))
            }
        }
    }

    fn read_row(&self, row: &SqliteRow) -> Result<Document> {
        let mut doc = Document::new();
        for (i, field) in self.schema.fields.iter().enumerate() {
            let value = match field.ty {
                FieldType::Double => row.try_get::<Option<f64>, _>(i)?.map(number_value),
                _ => row.try_get::<Option<String>, _>(i)?.map(Value::String),
            };
            if let Some(value) = value {
                doc.insert(field.name.to_string(), value);
            }
        }
        Ok(doc)
    }
}

/// Null-safe equality: SQLite's `IS` is true for `NULL IS NULL`.
fn eq_sql(column: &str, field: &Field, value: &Value, params: &mut Vec<SqlParam>) -> String {
    match SqlParam::for_field(field, value) {
        Some(param) => {
            params.push(param);
            format!("{} IS ?", column)
        }
        None => "0".to_string(),
    }
}

fn condition_sql(field: &Field, cond: &Condition, params: &mut Vec<SqlParam>) -> String {
    let column = quote_ident(field.name);
    let range = |op: &str, value: &Value, params: &mut Vec<SqlParam>| match SqlParam::for_field(
        field, value,
    ) {
        Some(SqlParam::Null) | None => "0".to_string(),
        Some(param) => {
            params.push(param);
            format!("COALESCE({} {} ?, 0)", column, op)
        }
    };
    let any_of = |values: &[Value], params: &mut Vec<SqlParam>| {
        if values.is_empty() {
            return "0".to_string();
        }
        let parts: Vec<String> = values
            .iter()
            .map(|v| eq_sql(&column, field, v, params))
            .collect();
        format!("({})", parts.join(" OR "))
    };

    match cond {
        Condition::Eq(v) => eq_sql(&column, field, v, params),
        Condition::Ne(v) => format!("NOT ({})", eq_sql(&column, field, v, params)),
        Condition::Gt(v) => range(">", v, params),
        Condition::Gte(v) => range(">=", v, params),
        Condition::Lt(v) => range("<", v, params),
        Condition::Lte(v) => range("<=", v, params),
        Condition::In(values) => any_of(values, params),
        Condition::Nin(values) => format!("NOT {}", any_of(values, params)),
        Condition::Exists(true) => format!("{} IS NOT NULL", column),
        Condition::Exists(false) => format!("{} IS NULL", column),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn scan(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>> {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY rowid",
            self.column_list(),
            self.table(),
            self.where_clause(filter, &mut params)?
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        tracing::debug!(sql = %sql, params = params.len(), "scanning collection");

        let mut query = sqlx::query(&sql);
        for param in params {
            query = param.bind(query);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to scan collection")?;

        rows.iter().map(|row| self.read_row(row)).collect()
    }

    async fn insert_documents(&self, docs: &[Document]) -> Result<usize> {
        let columns: Vec<String> = self.schema.fields.iter().map(|f| quote_ident(f.name)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<String> = columns
            .iter()
            .skip(1)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            self.table(),
            columns.join(", "),
            placeholders,
            columns[0],
            updates.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        for doc in docs {
            let mut query = sqlx::query(&sql);
            for field in &self.schema.fields {
                let value = doc.get(field.name).unwrap_or(&Value::Null);
                let param = SqlParam::for_field(field, value).with_context(|| {
                    format!("field `{}` has the wrong type: {}", field.name, value)
                })?;
                query = param.bind(query);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(docs.len())
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn count_matching(&self, filter: &Filter) -> Result<u64> {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.table(),
            self.where_clause(filter, &mut params)?
        );
        tracing::debug!(sql = %sql, params = params.len(), "counting matches");

        let mut query = sqlx::query(&sql);
        for param in params {
            query = param.bind(query);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .context("Failed to count matches")?;
        let n: i64 = row.try_get(0)?;
        Ok(n as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
