//! SQLite height-gated store.
//!
//! Persists every projected row in a single `entities` table. Uses `sqlx`
//! with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainview_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./chainview.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainview_core::error::ViewError;
use chainview_core::store::{HeightGatedStore, StoredRow, WriteOutcome};
use chainview_core::types::Height;

const UPSERT: &str = "INSERT INTO entities (kind, natural_key, scope, height, deleted, payload)
     VALUES (?, ?, ?, ?, ?, ?)
     ON CONFLICT (kind, natural_key) DO UPDATE SET
         scope   = excluded.scope,
         height  = excluded.height,
         deleted = excluded.deleted,
         payload = excluded.payload
     WHERE entities.height <= excluded.height";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainview.db"`) or a full
    /// SQLite URL (`"sqlite:./chainview.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ViewError> {
        Self::open_with(path, 5).await
    }

    pub async fn open_with(path: &str, max_connections: u32) -> Result<Self, ViewError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&url)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own empty database, so the
    /// pool is pinned to one connection.
    pub async fn in_memory() -> Result<Self, ViewError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), ViewError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entities (
                kind        TEXT    NOT NULL,
                natural_key TEXT    NOT NULL,
                scope       TEXT    NOT NULL,
                height      INTEGER NOT NULL,
                deleted     INTEGER NOT NULL DEFAULT 0,
                payload     TEXT    NOT NULL,
                PRIMARY KEY (kind, natural_key)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_scope ON entities (kind, scope);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!("sqlite schema initialized");
        Ok(())
    }

    async fn write(&self, row: &StoredRow) -> Result<WriteOutcome, ViewError> {
        let payload = serde_json::to_string(&row.payload)?;
        let result = sqlx::query(UPSERT)
            .bind(&row.kind)
            .bind(&row.key)
            .bind(&row.scope)
            .bind(row.height as i64)
            .bind(row.deleted)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(if result.rows_affected() > 0 {
            WriteOutcome::Applied
        } else {
            debug!(kind = %row.kind, key = %row.key, height = row.height, "stale write ignored");
            WriteOutcome::Stale
        })
    }
}

#[async_trait]
impl HeightGatedStore for SqliteStore {
    async fn upsert(&self, row: &StoredRow) -> Result<WriteOutcome, ViewError> {
        self.write(row).await
    }

    async fn delete(
        &self,
        kind: &str,
        key: &str,
        scope: &str,
        height: Height,
    ) -> Result<WriteOutcome, ViewError> {
        self.write(&StoredRow {
            kind: kind.to_string(),
            key: key.to_string(),
            scope: scope.to_string(),
            height,
            deleted: true,
            payload: serde_json::Value::Null,
        })
        .await
    }

    async fn delete_scope(&self, kind: &str, scope: &str, height: Height) -> Result<u64, ViewError> {
        let result = sqlx::query("DELETE FROM entities WHERE kind = ? AND scope = ?")
            .bind(kind)
            .bind(scope)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!(kind, scope, height, removed = result.rows_affected(), "scope cleared");
        Ok(result.rows_affected())
    }

    async fn get(&self, kind: &str, key: &str) -> Result<Option<StoredRow>, ViewError> {
        let row = sqlx::query(
            "SELECT kind, natural_key, scope, height, deleted, payload
             FROM entities WHERE kind = ? AND natural_key = ? AND deleted = 0",
        )
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn deleted_at(&self, kind: &str, key: &str) -> Result<Option<Height>, ViewError> {
        let height: Option<i64> = sqlx::query_scalar(
            "SELECT height FROM entities WHERE kind = ? AND natural_key = ? AND deleted = 1",
        )
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(height.map(|h| h as Height))
    }

    async fn list_scope(&self, kind: &str, scope: &str) -> Result<Vec<StoredRow>, ViewError> {
        let rows = sqlx::query(
            "SELECT kind, natural_key, scope, height, deleted, payload
             FROM entities WHERE kind = ? AND scope = ? AND deleted = 0
             ORDER BY natural_key",
        )
        .bind(kind)
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(decode).collect()
    }

    async fn list_kind(&self, kind: &str) -> Result<Vec<StoredRow>, ViewError> {
        let rows = sqlx::query(
            "SELECT kind, natural_key, scope, height, deleted, payload
             FROM entities WHERE kind = ? AND deleted = 0
             ORDER BY natural_key",
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(decode).collect()
    }
}

fn decode(row: &SqliteRow) -> Result<StoredRow, ViewError> {
    let payload: String = row.try_get("payload").map_err(storage_err)?;
    Ok(StoredRow {
        kind: row.try_get("kind").map_err(storage_err)?,
        key: row.try_get("natural_key").map_err(storage_err)?,
        scope: row.try_get("scope").map_err(storage_err)?,
        height: row.try_get::<i64, _>("height").map_err(storage_err)? as Height,
        deleted: row.try_get("deleted").map_err(storage_err)?,
        payload: serde_json::from_str(&payload)?,
    })
}

fn storage_err(e: sqlx::Error) -> ViewError {
    ViewError::Storage(e.to_string())
}
