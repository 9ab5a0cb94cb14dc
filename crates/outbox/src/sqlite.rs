//! Outbox persisted in SQLite.
//!
//! Two tables, `operations` and `mappings`, created on open together with an
//! index on `operations(created_at)`. Timestamps are stored as fixed-width
//! RFC 3339 strings (nanoseconds, `Z`), so text order equals time order.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fastnow_core::{Action, Entity, EntityId, LocalId, OperationId, UserId};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::OutboxError;
use crate::store::OutboxStore;
use crate::types::{IdMapping, QueuedOperation};

/// SQLite-backed outbox store.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create outbox directory at {parent:?}"))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to create SQLite pool for outbox at {path:?}"))?;

        Self::from_pool(pool).await
    }

    /// Open the database in the platform data directory.
    pub async fn open_default() -> anyhow::Result<Self> {
        let path = default_db_path()?;
        Self::open(&path).await
    }

    /// Private in-memory database (tests/dev).
    ///
    /// Pinned to a single connection that is never recycled, since every
    /// SQLite in-memory connection is its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory SQLite URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory SQLite outbox")?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating tables and indexes if needed.
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id            TEXT PRIMARY KEY,
                entity        TEXT NOT NULL,
                action        TEXT NOT NULL,
                user_id       TEXT NOT NULL,
                target_local  TEXT NULL,
                target_remote TEXT NULL,
                payload       TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                attempts      INTEGER NOT NULL DEFAULT 0,
                last_error    TEXT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create operations table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS operations_created_at ON operations (created_at)")
            .execute(&pool)
            .await
            .context("failed to create operations index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mappings (
                local_id   TEXT PRIMARY KEY,
                server_id  TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create mappings table")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn insert(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
        let (target_local, target_remote) = split_target(op.target.as_ref());

        sqlx::query(
            r#"
            INSERT INTO operations (
                id,
                entity,
                action,
                user_id,
                target_local,
                target_remote,
                payload,
                created_at,
                attempts,
                last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(op.id.to_string())
        .bind(op.entity.as_str())
        .bind(op.action.as_str())
        .bind(op.user_id.to_string())
        .bind(target_local)
        .bind(target_remote)
        .bind(op.payload.to_string())
        .bind(timestamp(op.created_at))
        .bind(i64::from(op.attempts))
        .bind(op.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, user_id: Option<UserId>) -> Result<Vec<QueuedOperation>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                entity,
                action,
                user_id,
                target_local,
                target_remote,
                payload,
                created_at,
                attempts,
                last_error
            FROM operations
            WHERE ?1 IS NULL OR user_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(user_id.map(|u| u.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_operation).collect()
    }

    async fn get(&self, id: OperationId) -> Result<Option<QueuedOperation>, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                entity,
                action,
                user_id,
                target_local,
                target_remote,
                payload,
                created_at,
                attempts,
                last_error
            FROM operations
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_operation).transpose()
    }

    async fn update(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
        let (target_local, target_remote) = split_target(op.target.as_ref());

        let result = sqlx::query(
            r#"
            UPDATE operations
            SET target_local = ?2,
                target_remote = ?3,
                payload = ?4,
                attempts = ?5,
                last_error = ?6
            WHERE id = ?1
            "#,
        )
        .bind(op.id.to_string())
        .bind(target_local)
        .bind(target_remote)
        .bind(op.payload.to_string())
        .bind(i64::from(op.attempts))
        .bind(op.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(op.id));
        }
        Ok(())
    }

    async fn remove(&self, id: OperationId) -> Result<bool, OutboxError> {
        let result = sqlx::query("DELETE FROM operations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_user(&self, user_id: UserId) -> Result<usize, OutboxError> {
        let result = sqlx::query("DELETE FROM operations WHERE user_id = ?1")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, OutboxError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn get_mapping(&self, local_id: LocalId) -> Result<Option<IdMapping>, OutboxError> {
        let row = sqlx::query(
            "SELECT local_id, server_id, created_at FROM mappings WHERE local_id = ?1",
        )
        .bind(local_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_mapping).transpose()
    }

    async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT server_id FROM mappings WHERE local_id = ?1")
                .bind(mapping.local_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some(server_id) if server_id == mapping.server_id => {}
            Some(server_id) => {
                return Err(OutboxError::MappingConflict {
                    local_id: mapping.local_id,
                    existing: server_id,
                    requested: mapping.server_id.clone(),
                });
            }
            None => {
                sqlx::query(
                    "INSERT INTO mappings (local_id, server_id, created_at) VALUES (?1, ?2, ?3)",
                )
                .bind(mapping.local_id.to_string())
                .bind(&mapping.server_id)
                .bind(timestamp(mapping.created_at))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn purge_mappings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query("DELETE FROM mappings WHERE created_at < ?1")
            .bind(timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, OutboxError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OutboxError::Corrupt(format!("{column}: {e}")))
}

fn split_target(target: Option<&EntityId>) -> (Option<String>, Option<String>) {
    (
        target.and_then(EntityId::as_local).map(|id| id.to_string()),
        target.and_then(EntityId::as_remote).map(str::to_string),
    )
}

fn corrupt(column: &str) -> impl Fn(fastnow_core::DomainError) -> OutboxError + '_ {
    move |e| OutboxError::Corrupt(format!("{column}: {e}"))
}

/// Map a database row into a `QueuedOperation`.
fn row_to_operation(row: SqliteRow) -> Result<QueuedOperation, OutboxError> {
    let id_str: String = row.try_get("id")?;
    let id = id_str.parse::<OperationId>().map_err(corrupt("id"))?;

    let entity_str: String = row.try_get("entity")?;
    let entity = entity_str.parse::<Entity>().map_err(corrupt("entity"))?;

    let action_str: String = row.try_get("action")?;
    let action = action_str.parse::<Action>().map_err(corrupt("action"))?;

    let user_str: String = row.try_get("user_id")?;
    let user_id = user_str.parse::<UserId>().map_err(corrupt("user_id"))?;

    let target_local: Option<String> = row.try_get("target_local")?;
    let target_remote: Option<String> = row.try_get("target_remote")?;
    let target = match (target_local, target_remote) {
        (Some(local), None) => Some(EntityId::Local(
            local.parse::<LocalId>().map_err(corrupt("target_local"))?,
        )),
        (None, Some(remote)) => Some(EntityId::Remote(remote)),
        (None, None) => None,
        (Some(_), Some(_)) => {
            return Err(OutboxError::Corrupt(format!(
                "operation {id} has both a local and a remote target"
            )));
        }
    };

    let payload_str: String = row.try_get("payload")?;
    let payload: Value = serde_json::from_str(&payload_str)
        .map_err(|e| OutboxError::Corrupt(format!("payload: {e}")))?;

    let created_at_str: String = row.try_get("created_at")?;
    let created_at = parse_timestamp("created_at", &created_at_str)?;

    let attempts: i64 = row.try_get("attempts")?;
    let attempts = u32::try_from(attempts)
        .map_err(|_| OutboxError::Corrupt(format!("attempts out of range: {attempts}")))?;

    let last_error: Option<String> = row.try_get("last_error")?;

    Ok(QueuedOperation {
        id,
        entity,
        action,
        user_id,
        target,
        payload,
        created_at,
        attempts,
        last_error,
    })
}

fn row_to_mapping(row: SqliteRow) -> Result<IdMapping, OutboxError> {
    let local_str: String = row.try_get("local_id")?;
    let local_id = local_str.parse::<LocalId>().map_err(corrupt("local_id"))?;
    let server_id: String = row.try_get("server_id")?;
    let created_at_str: String = row.try_get("created_at")?;

    Ok(IdMapping {
        local_id,
        server_id,
        created_at: parse_timestamp("created_at", &created_at_str)?,
    })
}

/// Resolve the default database location: `{data_dir}/fastnow/outbox.db`.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut path = base;
    path.push("fastnow");
    path.push("outbox.db");
    Ok(path)
}
