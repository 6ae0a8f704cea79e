use progress_core::model::{ChallengeId, OwnerKey};
use progress_core::ProgressRecord;

use super::{SqliteRepository, mapping::map_progress_row};
use crate::repository::{ProgressRepository, ReassignPolicy, StorageError};

#[async_trait::async_trait]
impl ProgressRepository for SqliteRepository {
    async fn get(
        &self,
        owner: &OwnerKey,
        challenge_id: &ChallengeId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT
                owner_key, challenge_id, selected_option_id, is_completed,
                completed_at, sync_state, updated_at
            FROM progress_records
            WHERE owner_key = ?1 AND challenge_id = ?2
            ",
        )
        .bind(owner.to_string())
        .bind(challenge_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        row.as_ref().map(map_progress_row).transpose()
    }

    async fn put(&self, record: &ProgressRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO progress_records (
                owner_key, challenge_id, selected_option_id, is_completed,
                completed_at, sync_state, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(owner_key, challenge_id) DO UPDATE SET
                selected_option_id = excluded.selected_option_id,
                is_completed = excluded.is_completed,
                completed_at = excluded.completed_at,
                sync_state = excluded.sync_state,
                updated_at = excluded.updated_at
            ",
        )
        .bind(record.owner().to_string())
        .bind(record.challenge_id().as_str())
        .bind(record.selected_option_id().as_str())
        .bind(record.is_completed())
        .bind(record.completed_at())
        .bind(record.sync_state().as_str())
        .bind(record.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(())
    }

    async fn list_by_owner(&self, owner: &OwnerKey) -> Result<Vec<ProgressRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT
                owner_key, challenge_id, selected_option_id, is_completed,
                completed_at, sync_state, updated_at
            FROM progress_records
            WHERE owner_key = ?1
            ORDER BY challenge_id ASC
            ",
        )
        .bind(owner.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        rows.iter().map(map_progress_row).collect()
    }

    async fn reassign_owner(
        &self,
        old: &OwnerKey,
        new: &OwnerKey,
        policy: ReassignPolicy,
    ) -> Result<u64, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let old_rows = sqlx::query(
            r"
            SELECT
                owner_key, challenge_id, selected_option_id, is_completed,
                completed_at, sync_state, updated_at
            FROM progress_records
            WHERE owner_key = ?1
            ",
        )
        .bind(old.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut moved = 0u64;
        for row in &old_rows {
            let mut record = map_progress_row(row)?;

            let existing = sqlx::query(
                r"
                SELECT
                    owner_key, challenge_id, selected_option_id, is_completed,
                    completed_at, sync_state, updated_at
                FROM progress_records
                WHERE owner_key = ?1 AND challenge_id = ?2
                ",
            )
            .bind(new.to_string())
            .bind(record.challenge_id().as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

            let old_wins = match (policy, &existing) {
                (_, None) => true,
                (ReassignPolicy::KeepExisting, Some(_)) => false,
                // A tie keeps the record already under the new owner.
                (ReassignPolicy::PreferNewest, Some(row)) => {
                    record.updated_at() > map_progress_row(row)?.updated_at()
                }
            };

            sqlx::query("DELETE FROM progress_records WHERE owner_key = ?1 AND challenge_id = ?2")
                .bind(old.to_string())
                .bind(record.challenge_id().as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;

            if old_wins {
                record.set_owner(new.clone());
                sqlx::query(
                    r"
                    INSERT INTO progress_records (
                        owner_key, challenge_id, selected_option_id, is_completed,
                        completed_at, sync_state, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(owner_key, challenge_id) DO UPDATE SET
                        selected_option_id = excluded.selected_option_id,
                        is_completed = excluded.is_completed,
                        completed_at = excluded.completed_at,
                        sync_state = excluded.sync_state,
                        updated_at = excluded.updated_at
                    ",
                )
                .bind(record.owner().to_string())
                .bind(record.challenge_id().as_str())
                .bind(record.selected_option_id().as_str())
                .bind(record.is_completed())
                .bind(record.completed_at())
                .bind(record.sync_state().as_str())
                .bind(record.updated_at())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Connection(e.to_string()))?;
                moved += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(moved)
    }
}
