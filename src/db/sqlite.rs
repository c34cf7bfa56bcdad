//! SQLite-backed document store.
//!
//! Every document is one row of the `documents` table with its body stored as JSON.
//! Query filters and ordering are evaluated with `json_extract`, and each commit runs
//! inside a `BEGIN IMMEDIATE` transaction so concurrent conditional writes serialize.
//! Transactions are held through sqlx's [`sqlx::Transaction`] guard.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use super::{
    split_path, DocKey, Direction, Document, DocumentStore, FilterOp, Query, StoreError,
    StoredDocument, Write, WriteBatch,
};

pub struct SqliteStore {
    pool: SqlitePool,
    max_batch_size: usize,
}

/// Execute a SQL migration file, properly handling comments
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        // Strip SQL comment lines (lines starting with --)
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    // Migration 001: Document table
    execute_sql(pool, include_str!("../../migrations/001_documents.sql")).await?;

    Ok(())
}

impl SqliteStore {
    /// Open (creating if needed) `voltrack.db` inside `data_dir`
    pub async fn open(data_dir: &Path, max_connections: u32, max_batch_size: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("voltrack.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        info!("Initializing database at {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&db_url)
            .await?;

        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        Self::from_pool(pool, max_batch_size).await
    }

    /// Wrap an existing pool, applying the schema
    pub async fn from_pool(pool: SqlitePool, max_batch_size: usize) -> Result<Self> {
        run_migrations(&pool).await?;
        info!("Database initialized successfully");
        Ok(Self {
            pool,
            max_batch_size: max_batch_size.max(1),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
}

/// Quote each path segment so numeric keys (hour slots) address object members
fn json_path(field: &str) -> Result<String, StoreError> {
    let segments = split_path(field)?;
    let mut path = String::from("$");
    for segment in segments {
        if segment.contains('"') {
            return Err(StoreError::InvalidField(field.to_string()));
        }
        path.push_str(&format!(".\"{}\"", segment));
    }
    Ok(path)
}

/// SQLite-side representation of a JSON scalar; `None` for null
fn scalar_bind(field: &str, value: &Value) -> Result<Option<Bind>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(Bind::Int(i64::from(*b)))),
        Value::String(s) => Ok(Some(Bind::Text(s.clone()))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Some(Bind::Int(i))),
            None => n
                .as_f64()
                .map(|f| Some(Bind::Real(f)))
                .ok_or_else(|| StoreError::InvalidField(field.to_string())),
        },
        Value::Array(_) | Value::Object(_) => Err(StoreError::InvalidField(field.to_string())),
    }
}

fn parse_body(key: &DocKey, body: &str) -> Result<Document, StoreError> {
    serde_json::from_str(body).map_err(|e| {
        warn!(document = %key, error = %e, "Stored document is not a JSON object");
        StoreError::Serialization(e)
    })
}

async fn load_document(
    conn: &mut SqliteConnection,
    key: &DocKey,
) -> Result<Option<Document>, StoreError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(&key.collection)
            .bind(&key.id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|(body,)| parse_body(key, &body)).transpose()
}

async fn apply_writes(conn: &mut SqliteConnection, writes: Vec<Write>) -> Result<(), StoreError> {
    let mut staged: BTreeMap<DocKey, Option<Document>> = BTreeMap::new();

    for write in &writes {
        let key = write.op.key();
        let current = match staged.get(key) {
            Some(doc) => doc.clone(),
            None => load_document(conn, key).await?,
        };

        if let Some(precondition) = &write.precondition {
            precondition.check(key, current.as_ref())?;
        }

        let next = write.op.apply(current)?;
        staged.insert(key.clone(), next);
    }

    for (key, doc) in staged {
        match doc {
            Some(doc) => {
                let body = serde_json::to_string(&doc)?;
                sqlx::query(
                    r#"
                    INSERT INTO documents (collection, id, body, updated_at)
                    VALUES (?, ?, ?, datetime('now'))
                    ON CONFLICT(collection, id) DO UPDATE SET
                        body = excluded.body,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&key.collection)
                .bind(&key.id)
                .bind(body)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                    .bind(&key.collection)
                    .bind(&key.id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }

    Ok(())
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, key: &DocKey) -> Result<Option<Document>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM documents WHERE collection = ? AND id = ?")
                .bind(&key.collection)
                .bind(&key.id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(body,)| parse_body(key, &body)).transpose()
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
        let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
        let mut binds = vec![Bind::Text(query.collection.clone())];

        for filter in &query.filters {
            let path = json_path(&filter.field)?;
            match scalar_bind(&filter.field, &filter.value)? {
                Some(bind) => {
                    sql.push_str(&format!(" AND json_extract(body, ?) {} ?", filter.op.sql()));
                    binds.push(Bind::Text(path));
                    binds.push(bind);
                }
                None if filter.op == FilterOp::Eq => {
                    sql.push_str(" AND json_type(body, ?) = 'null'");
                    binds.push(Bind::Text(path));
                }
                None => return Err(StoreError::InvalidField(filter.field.clone())),
            }
        }

        if let Some((field, direction)) = &query.order_by {
            let direction = match direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            sql.push_str(&format!(" ORDER BY json_extract(body, ?) {}, id ASC", direction));
            binds.push(Bind::Text(json_path(field)?));
        } else {
            sql.push_str(" ORDER BY id ASC");
        }

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            binds.push(Bind::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let mut statement = sqlx::query_as::<_, (String, String)>(&sql);
        for bind in binds {
            statement = match bind {
                Bind::Text(value) => statement.bind(value),
                Bind::Int(value) => statement.bind(value),
                Bind::Real(value) => statement.bind(value),
            };
        }

        let rows = statement.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(id, body)| {
                let data = parse_body(&DocKey::new(query.collection.as_str(), id.as_str()), &body)?;
                Ok(StoredDocument { id, data })
            })
            .collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        batch.ensure_within(self.max_batch_size)?;
        if batch.is_empty() {
            return Ok(());
        }

        // The guard rolls back on drop, so a cancelled commit never leaks an open
        // transaction back into the pool
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        apply_writes(&mut tx, batch.into_writes()).await?;
        tx.commit().await?;
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Precondition, WriteOp};
    use serde_json::json;
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path(), 4, 500).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_json_path_quotes_segments() {
        assert_eq!(json_path("date").unwrap(), "$.\"date\"");
        assert_eq!(
            json_path("hourly_consumption.7").unwrap(),
            "$.\"hourly_consumption\".\"7\""
        );
        assert!(json_path("bad\"field").is_err());
        assert!(json_path("").is_err());
    }

    #[tokio::test]
    async fn test_round_trips_documents_and_merges_paths() {
        let (_dir, store) = open_temp().await;
        let key = DocKey::new("users/u1/consumption_history", "2024-06-01");

        store
            .merge(
                &key,
                vec![
                    ("date".to_string(), json!("2024-06-01")),
                    ("hourly_consumption.7".to_string(), json!(0.5)),
                ],
            )
            .await
            .unwrap();
        store
            .merge(&key, vec![("hourly_consumption.8".to_string(), json!(0.75))])
            .await
            .unwrap();

        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(
            Value::Object(stored),
            json!({"date": "2024-06-01", "hourly_consumption": {"7": 0.5, "8": 0.75}})
        );
    }

    #[tokio::test]
    async fn test_query_filters_and_orders_with_json_extract() {
        let (_dir, store) = open_temp().await;
        for (id, date, total) in [
            ("2024-06-03", "2024-06-03", 3.0),
            ("2024-06-01", "2024-06-01", 1.0),
            ("2024-06-02", "2024-06-02", 2.5),
        ] {
            store
                .set(
                    &DocKey::new("history", id),
                    doc(json!({"date": date, "total_consumption": total, "active": true})),
                )
                .await
                .unwrap();
        }

        let results = store
            .query(
                &Query::new("history")
                    .filter("date", FilterOp::Lt, "2024-06-03")
                    .eq("active", true)
                    .order_by("date", Direction::Desc),
            )
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["2024-06-02", "2024-06-01"]);

        let heavy = store
            .query(&Query::new("history").filter("total_consumption", FilterOp::Gt, 2.0))
            .await
            .unwrap();
        assert_eq!(heavy.len(), 2);
    }

    #[tokio::test]
    async fn test_precondition_failure_leaves_no_partial_writes() {
        let (_dir, store) = open_temp().await;
        let device = DocKey::new("devices", "d1");
        store
            .set(&device, doc(json!({"owner_flag": "user", "user_id": "u1"})))
            .await
            .unwrap();

        let mut batch = WriteBatch::new();
        batch.set(DocKey::new("other", "x"), doc(json!({"v": 1})));
        batch.push(
            WriteOp::Merge {
                key: device.clone(),
                fields: vec![("user_id".to_string(), json!("u2"))],
            },
            Some(Precondition::field_equals("owner_flag", "template")),
        );

        assert!(matches!(
            store.commit(batch).await,
            Err(StoreError::PreconditionFailed(_))
        ));
        assert!(store.get(&DocKey::new("other", "x")).await.unwrap().is_none());
        let unchanged = store.get(&device).await.unwrap().unwrap();
        assert_eq!(unchanged.get("user_id"), Some(&json!("u1")));
    }

    #[tokio::test]
    async fn test_cancelled_commit_does_not_poison_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path(), 1, 500).await.unwrap());

        for round in 0..12 {
            let collection = format!("bulk-{}", round);
            let writer = store.clone();
            let target = collection.clone();
            let handle = tokio::spawn(async move {
                let mut batch = WriteBatch::new();
                for i in 0..40 {
                    batch.set(DocKey::new(target.as_str(), format!("d{}", i)), doc(json!({"i": i})));
                }
                writer.commit(batch).await
            });
            for _ in 0..round {
                tokio::task::yield_now().await;
            }
            handle.abort();
            let _ = handle.await;

            // The single pooled connection must come back usable
            store
                .set(&DocKey::new("markers", format!("m{}", round)), doc(json!({"round": round})))
                .await
                .unwrap();

            let landed = store.query(&Query::new(collection.as_str())).await.unwrap().len();
            assert!(landed == 0 || landed == 40, "partial batch of {} writes", landed);
        }

        assert_eq!(store.query(&Query::new("markers")).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_concurrent_conditional_claims_have_one_winner() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        let template = DocKey::new("devices", "tpl");
        store
            .set(&template, doc(json!({"owner_flag": "template"})))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let store = store.clone();
            let template = template.clone();
            handles.push(tokio::spawn(async move {
                let mut batch = WriteBatch::new();
                batch.push(
                    WriteOp::Merge {
                        key: template,
                        fields: vec![
                            ("owner_flag".to_string(), json!("user")),
                            ("user_id".to_string(), json!(user)),
                        ],
                    },
                    Some(Precondition::field_equals("owner_flag", "template")),
                );
                store.commit(batch).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(StoreError::PreconditionFailed(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
