//! Postgres backend: every collection lives in one `documents` JSONB table.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::document::{validate_collection, Document, DocumentStore, Filter, StoreError, WriteOp};

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to document database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running document store migrations")
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(code) if code == "40001" || code == "40P01" || code.starts_with("08")
        ),
        _ => false,
    };
    if transient {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

/// Appends the SQL predicate for `filter` over the `doc` column.
pub(crate) fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            builder.push("TRUE");
        }
        Filter::Eq { field, value } => {
            builder
                .push("doc -> ")
                .push_bind(field.clone())
                .push(" = ")
                .push_bind(Json(value.clone()));
        }
        Filter::Range { field, from, to } => {
            builder.push("(TRUE");
            if let Some(from) = from {
                builder
                    .push(" AND doc -> ")
                    .push_bind(field.clone())
                    .push(" >= ")
                    .push_bind(Json(from.clone()));
            }
            if let Some(to) = to {
                builder
                    .push(" AND doc -> ")
                    .push_bind(field.clone())
                    .push(" <= ")
                    .push_bind(Json(to.clone()));
            }
            builder.push(")");
        }
        Filter::And(filters) => {
            builder.push("(TRUE");
            for inner in filters {
                builder.push(" AND ");
                push_filter(builder, inner);
            }
            builder.push(")");
        }
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, StoreError> {
    let id: String = row.try_get("id").map_err(classify)?;
    let Json(body): Json<Value> = row.try_get("doc").map_err(classify)?;
    Ok(Document { id, body })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        validate_collection(collection)?;
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        match row {
            Some(row) => {
                let Json(body): Json<Value> = row.try_get("doc").map_err(classify)?;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let rows = sqlx::query(
            "SELECT id, doc FROM documents WHERE collection = $1 AND id = ANY($2) ORDER BY id",
        )
        .bind(collection)
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        validate_collection(collection)?;
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (collection, id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(doc))
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let mut builder = QueryBuilder::<Postgres>::new("SELECT id, doc FROM documents WHERE collection = ");
        builder.push_bind(collection.to_string()).push(" AND ");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id");
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM documents
             WHERE collection = $1 AND ($2::TEXT IS NULL OR id > $2)
             ORDER BY id
             LIMIT $3
            "#,
        )
        .bind(collection)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in &ops {
            validate_collection(op.collection())?;
        }
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for op in ops {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    doc,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, doc, updated_at)
                        VALUES ($1, $2, $3, now())
                        ON CONFLICT (collection, id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()
                        "#,
                    )
                    .bind(collection)
                    .bind(id)
                    .bind(Json(doc))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                }
                WriteOp::Delete { collection, id } => {
                    sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                        .bind(collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(classify)?;
                }
            }
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        validate_collection(collection)?;
        let row = sqlx::query("SELECT COUNT(*)::BIGINT AS n FROM documents WHERE collection = $1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        let n: i64 = row.try_get("n").map_err(classify)?;
        Ok(n.max(0) as u64)
    }
}
