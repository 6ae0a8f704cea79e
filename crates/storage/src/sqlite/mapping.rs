use chrono::{DateTime, Utc};
use progress_core::model::{ChallengeId, OptionId, OwnerKey, ProgressMutation, SyncState};
use progress_core::ProgressRecord;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::repository::{StorageError, SyncQueueEntry};

pub(super) fn parse_owner(raw: &str) -> Result<OwnerKey, StorageError> {
    raw.parse::<OwnerKey>()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(super) fn map_progress_row(row: &SqliteRow) -> Result<ProgressRecord, StorageError> {
    let owner_raw: String = row
        .try_get("owner_key")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let challenge_id: String = row
        .try_get("challenge_id")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let selected_option_id: String = row
        .try_get("selected_option_id")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let is_completed: bool = row
        .try_get("is_completed")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let completed_at: Option<DateTime<Utc>> = row
        .try_get("completed_at")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let sync_state_raw: String = row
        .try_get("sync_state")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let sync_state = SyncState::parse(&sync_state_raw).ok_or_else(|| {
        StorageError::Serialization(format!("unknown sync_state: {sync_state_raw}"))
    })?;

    Ok(ProgressRecord::from_persisted(
        parse_owner(&owner_raw)?,
        ChallengeId::new(challenge_id),
        OptionId::new(selected_option_id),
        is_completed,
        completed_at,
        sync_state,
        updated_at,
    ))
}

pub(super) fn map_queue_row(row: &SqliteRow) -> Result<SyncQueueEntry, StorageError> {
    let id: Uuid = row
        .try_get("id")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let payload: String = row
        .try_get("payload")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mutation: ProgressMutation = serde_json::from_str(&payload)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let enqueued_at: DateTime<Utc> = row
        .try_get("enqueued_at")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let attempt_count: i64 = row
        .try_get("attempt_count")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let last_attempt_at: Option<DateTime<Utc>> = row
        .try_get("last_attempt_at")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let last_error: Option<String> = row
        .try_get("last_error")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let failed: bool = row
        .try_get("failed")
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(SyncQueueEntry {
        id,
        mutation,
        enqueued_at,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StorageError::Serialization("attempt_count overflow".into()))?,
        last_attempt_at,
        last_error,
        failed,
    })
}
