//! SQLite-backed document store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{DocumentRecord, DocumentStore};
use crate::error::CoreError;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

type DocumentRow = (String, String, i64, i64, String);

/// SQLite-backed document store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/node-0.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Persistence {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Persistence {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::Persistence {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

fn decode_row(row: DocumentRow) -> Result<DocumentRecord, CoreError> {
    let (link, kind, version, update_time_micros, body) = row;
    let body = serde_json::from_str(&body).map_err(|e| CoreError::Persistence {
        operation: "decode".to_string(),
        details: format!("Corrupt body for {}: {}", link, e),
    })?;
    Ok(DocumentRecord {
        link,
        kind,
        version: version.max(0) as u64,
        update_time_micros: update_time_micros.max(0) as u64,
        body,
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, link: &str) -> Result<Option<DocumentRecord>, CoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT self_link, kind, version, update_time_micros, body
            FROM documents
            WHERE self_link = ?
            "#,
        )
        .bind(link)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_row).transpose()
    }

    async fn put(&self, record: DocumentRecord) -> Result<(), CoreError> {
        let body = serde_json::to_string(&record.body).map_err(|e| CoreError::Persistence {
            operation: "encode".to_string(),
            details: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO documents (self_link, kind, version, update_time_micros, body)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (self_link) DO UPDATE SET
                kind = excluded.kind,
                version = excluded.version,
                update_time_micros = excluded.update_time_micros,
                body = excluded.body
            "#,
        )
        .bind(&record.link)
        .bind(&record.kind)
        .bind(i64::try_from(record.version).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.update_time_micros).unwrap_or(i64::MAX))
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, link: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE self_link = ?")
            .bind(link)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, kind: Option<&str>) -> Result<Vec<DocumentRecord>, CoreError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query_as::<_, DocumentRow>(
                    r#"
                    SELECT self_link, kind, version, update_time_micros, body
                    FROM documents
                    WHERE kind = ?
                    ORDER BY self_link
                    "#,
                )
                .bind(kind)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DocumentRow>(
                    r#"
                    SELECT self_link, kind, version, update_time_micros, body
                    FROM documents
                    ORDER BY self_link
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(decode_row).collect()
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
