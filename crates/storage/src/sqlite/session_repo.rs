use chrono::{DateTime, Utc};
use progress_core::model::AnonymousSessionId;
use sqlx::Row;
use uuid::Uuid;

use super::SqliteRepository;
use crate::repository::{SessionRepository, StorageError};

const LAST_SYNCED_AT_KEY: &str = "last_synced_at";

#[async_trait::async_trait]
impl SessionRepository for SqliteRepository {
    async fn current_anonymous(&self) -> Result<Option<AnonymousSessionId>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT id FROM anonymous_sessions
            WHERE superseded = 0
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        match row {
            Some(row) => {
                let id: Uuid = row
                    .try_get("id")
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(AnonymousSessionId::from_uuid(id)))
            }
            None => Ok(None),
        }
    }

    async fn save_anonymous(&self, id: AnonymousSessionId) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO anonymous_sessions (id, created_at, superseded)
            VALUES (?1, ?2, 0)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn mark_superseded(&self, id: AnonymousSessionId) -> Result<(), StorageError> {
        sqlx::query("UPDATE anonymous_sessions SET superseded = 1 WHERE id = ?1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn is_superseded(&self, id: AnonymousSessionId) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT superseded FROM anonymous_sessions WHERE id = ?1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        match row {
            Some(row) => row
                .try_get("superseded")
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(false),
        }
    }

    async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?1")
            .bind(LAST_SYNCED_AT_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .try_get("value")
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                let at = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(at.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
        )
        .bind(LAST_SYNCED_AT_KEY)
        .bind(at.to_rfc3339())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }
}
