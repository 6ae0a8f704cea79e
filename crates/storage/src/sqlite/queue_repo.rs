use chrono::{DateTime, Utc};
use progress_core::model::ProgressMutation;
use uuid::Uuid;

use super::{SqliteRepository, mapping::map_queue_row};
use crate::repository::{QueueRepository, StorageError, SyncQueueEntry};

#[async_trait::async_trait]
impl QueueRepository for SqliteRepository {
    async fn upsert(
        &self,
        mutation: &ProgressMutation,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueEntry, StorageError> {
        let payload = serde_json::to_string(mutation)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let existing = sqlx::query(
            r"
            SELECT id, payload, enqueued_at, attempt_count, last_attempt_at, last_error, failed
            FROM sync_queue
            WHERE owner_key = ?1 AND challenge_id = ?2 AND failed = 0
            ",
        )
        .bind(mutation.owner.to_string())
        .bind(mutation.challenge_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let entry = if let Some(row) = existing {
            // Collapse: latest payload, original position, fresh retries.
            let current = map_queue_row(&row)?;
            sqlx::query(
                r"
                UPDATE sync_queue SET
                    payload = ?2,
                    attempt_count = 0,
                    last_attempt_at = NULL,
                    last_error = NULL
                WHERE id = ?1
                ",
            )
            .bind(current.id)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

            SyncQueueEntry {
                mutation: mutation.clone(),
                attempt_count: 0,
                last_attempt_at: None,
                last_error: None,
                ..current
            }
        } else {
            let id = Uuid::new_v4();
            sqlx::query(
                r"
                INSERT INTO sync_queue (
                    id, owner_key, challenge_id, payload, enqueued_at,
                    attempt_count, last_attempt_at, last_error, failed
                )
                VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, NULL, 0)
                ",
            )
            .bind(id)
            .bind(mutation.owner.to_string())
            .bind(mutation.challenge_id.as_str())
            .bind(&payload)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

            SyncQueueEntry {
                id,
                mutation: mutation.clone(),
                enqueued_at: now,
                attempt_count: 0,
                last_attempt_at: None,
                last_error: None,
                failed: false,
            }
        };

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(entry)
    }

    async fn pending(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, payload, enqueued_at, attempt_count, last_attempt_at, last_error, failed
            FROM sync_queue
            WHERE failed = 0
            ORDER BY enqueued_at ASC, rowid ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        rows.iter().map(map_queue_row).collect()
    }

    async fn pending_count(&self) -> Result<u64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue WHERE failed = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(u64::try_from(row.0).unwrap_or_default())
    }

    async fn remove(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn remove_if_unchanged(
        &self,
        id: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let row = sqlx::query(
            r"
            SELECT id, payload, enqueued_at, attempt_count, last_attempt_at, last_error, failed
            FROM sync_queue
            WHERE id = ?1
            ",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let Some(row) = row else {
            return Ok(false);
        };
        if map_queue_row(&row)?.mutation.updated_at != updated_at {
            return Ok(false);
        }

        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(true)
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE sync_queue SET
                attempt_count = attempt_count + 1,
                last_attempt_at = ?2,
                last_error = ?3
            WHERE id = ?1
            ",
        )
        .bind(id)
        .bind(at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE sync_queue SET failed = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn failed(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, payload, enqueued_at, attempt_count, last_attempt_at, last_error, failed
            FROM sync_queue
            WHERE failed = 1
            ORDER BY enqueued_at ASC, rowid ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        rows.iter().map(map_queue_row).collect()
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE sync_queue SET
                failed = 0,
                attempt_count = 0,
                last_attempt_at = NULL,
                last_error = NULL,
                enqueued_at = ?2
            WHERE id = ?1 AND failed = 1
            ",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE failed = 1 AND enqueued_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sync_queue")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
