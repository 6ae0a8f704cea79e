use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progress_core::model::{AnonymousSessionId, ChallengeId, OwnerKey, ProgressMutation};
use progress_core::ProgressRecord;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How `reassign_owner` resolves a collision when the new owner already has
/// a record for the same challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignPolicy {
    /// Last write wins by `updated_at`; a tie keeps the record already under
    /// the new owner.
    PreferNewest,
    /// The record already under the new owner always wins.
    KeepExisting,
}

/// Persisted shape of one queued mutation awaiting server confirmation.
///
/// The queue never owns progress data: the underlying record always exists
/// in the progress store first, and an entry only carries the payload to
/// dispatch plus retry bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueEntry {
    pub id: Uuid,
    pub mutation: ProgressMutation,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failed: bool,
}

/// Repository contract for the local progress store.
///
/// At most one record exists per `(owner, challenge)` pair; `put` upserts
/// in place.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Fetch one record, if present.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure (absence is `Ok(None)`).
    async fn get(
        &self,
        owner: &OwnerKey,
        challenge_id: &ChallengeId,
    ) -> Result<Option<ProgressRecord>, StorageError>;

    /// Upsert a record by `(owner, challenge)`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the record cannot be stored.
    async fn put(&self, record: &ProgressRecord) -> Result<(), StorageError>;

    /// All records currently keyed to `owner`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn list_by_owner(&self, owner: &OwnerKey) -> Result<Vec<ProgressRecord>, StorageError>;

    /// Re-key every record under `old` to `new`, resolving collisions per
    /// `policy`. Returns the number of records that ended up re-keyed.
    ///
    /// Idempotent: once `old` holds no records, further calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn reassign_owner(
        &self,
        old: &OwnerKey,
        new: &OwnerKey,
        policy: ReassignPolicy,
    ) -> Result<u64, StorageError>;
}

/// Repository contract for the persisted sync queue.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Insert a new entry, or collapse into the existing entry for the same
    /// `(owner, challenge)`: the payload is replaced with the latest value,
    /// the original enqueue position is preserved, and retry bookkeeping is
    /// reset for the fresh payload.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the entry cannot be stored.
    async fn upsert(
        &self,
        mutation: &ProgressMutation,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueEntry, StorageError>;

    /// Queued (non-failed) entries in FIFO order of original enqueue time.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn pending(&self) -> Result<Vec<SyncQueueEntry>, StorageError>;

    /// Number of queued (non-failed) entries.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn pending_count(&self) -> Result<u64, StorageError>;

    /// Remove an acknowledged entry.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn remove(&self, id: Uuid) -> Result<(), StorageError>;

    /// Remove an entry only if its payload still carries `updated_at`.
    ///
    /// Returns `false` (and leaves the entry queued) when a newer mutation
    /// collapsed into the entry after the caller read it, so an
    /// acknowledgement for the old payload cannot discard the new one.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn remove_if_unchanged(
        &self,
        id: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Record one dispatch attempt (increments the attempt count).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn record_attempt(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Move an entry to the failed bucket (no further automatic retries).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn mark_failed(&self, id: Uuid) -> Result<(), StorageError>;

    /// Entries in the failed bucket, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn failed(&self) -> Result<Vec<SyncQueueEntry>, StorageError>;

    /// Move a failed entry back to the queue for another round of attempts.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StorageError>;

    /// Drop failed entries older than `cutoff`. Returns the removed count.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Discard all queued and failed entries. Returns the removed count.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn clear(&self) -> Result<u64, StorageError>;
}

/// Repository contract for anonymous-session lifecycle and sync metadata.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// The current (non-superseded) anonymous session, if one exists.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn current_anonymous(&self) -> Result<Option<AnonymousSessionId>, StorageError>;

    /// Persist a newly minted anonymous session id as current.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn save_anonymous(&self, id: AnonymousSessionId) -> Result<(), StorageError>;

    /// Mark a session id as consumed by migration. A superseded id is never
    /// reused for new writes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn mark_superseded(&self, id: AnonymousSessionId) -> Result<(), StorageError>;

    /// Whether the given id has been consumed by a completed migration.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn is_superseded(&self, id: AnonymousSessionId) -> Result<bool, StorageError>;

    /// Timestamp of the last fully drained sync, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Record the time of the last fully drained sync.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on adapter failure.
    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), StorageError>;
}

/// Aggregates the three repositories behind trait objects so backends can
/// be swapped (durable SQLite, or in-memory when durable storage fails).
#[derive(Clone)]
pub struct Storage {
    pub progress: Arc<dyn ProgressRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    /// True when durable storage was unavailable and this `Storage` runs
    /// in-memory only (progress will not survive a reload).
    pub degraded: bool,
}

impl Storage {
    /// Build a purely in-memory `Storage` (tests, or the degraded fallback).
    #[must_use]
    pub fn in_memory() -> Self {
        let store = crate::memory::InMemoryStore::new();
        Self {
            progress: Arc::new(store.clone()),
            queue: Arc::new(store.clone()),
            sessions: Arc::new(store),
            degraded: false,
        }
    }

    fn in_memory_degraded() -> Self {
        let mut storage = Self::in_memory();
        storage.degraded = true;
        storage
    }

    /// Build a `Storage` backed by `SQLite`, falling back to in-memory
    /// operation (with `degraded = true`) when the database cannot be
    /// opened or migrated. The fallback is deliberate: a missing local
    /// store must never block the answering flow.
    pub async fn sqlite_or_memory(database_url: &str) -> Self {
        match Self::sqlite(database_url).await {
            Ok(storage) => storage,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "durable storage unavailable, progress will not persist across restarts"
                );
                Self::in_memory_degraded()
            }
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
