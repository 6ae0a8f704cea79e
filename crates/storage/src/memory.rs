use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progress_core::model::{AnonymousSessionId, ChallengeId, OwnerKey, ProgressMutation};
use progress_core::ProgressRecord;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::repository::{
    ProgressRepository, QueueRepository, ReassignPolicy, SessionRepository, StorageError,
    SyncQueueEntry,
};

#[derive(Default)]
struct SessionState {
    current: Option<AnonymousSessionId>,
    superseded: HashSet<AnonymousSessionId>,
    last_synced_at: Option<DateTime<Utc>>,
}

/// In-memory implementation of all three repositories.
///
/// Used directly in tests, and as the degraded fallback when durable
/// storage is unavailable for the session.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<Mutex<HashMap<(OwnerKey, ChallengeId), ProgressRecord>>>,
    queue: Arc<Mutex<Vec<SyncQueueEntry>>>,
    session: Arc<Mutex<SessionState>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, StorageError> {
        mutex
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

#[async_trait]
impl ProgressRepository for InMemoryStore {
    async fn get(
        &self,
        owner: &OwnerKey,
        challenge_id: &ChallengeId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        let guard = Self::lock(&self.records)?;
        Ok(guard.get(&(owner.clone(), challenge_id.clone())).cloned())
    }

    async fn put(&self, record: &ProgressRecord) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.records)?;
        guard.insert(
            (record.owner().clone(), record.challenge_id().clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn list_by_owner(&self, owner: &OwnerKey) -> Result<Vec<ProgressRecord>, StorageError> {
        let guard = Self::lock(&self.records)?;
        let mut records: Vec<ProgressRecord> = guard
            .values()
            .filter(|r| r.owner() == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.challenge_id().cmp(b.challenge_id()));
        Ok(records)
    }

    async fn reassign_owner(
        &self,
        old: &OwnerKey,
        new: &OwnerKey,
        policy: ReassignPolicy,
    ) -> Result<u64, StorageError> {
        let mut guard = Self::lock(&self.records)?;

        let old_keys: Vec<(OwnerKey, ChallengeId)> = guard
            .keys()
            .filter(|(owner, _)| owner == old)
            .cloned()
            .collect();

        let mut moved = 0u64;
        for key in old_keys {
            let Some(mut record) = guard.remove(&key) else {
                continue;
            };
            let target_key = (new.clone(), key.1.clone());

            let old_wins = match (policy, guard.get(&target_key)) {
                (_, None) => true,
                (ReassignPolicy::KeepExisting, Some(_)) => false,
                // A tie keeps the record already under the new owner.
                (ReassignPolicy::PreferNewest, Some(existing)) => {
                    record.updated_at() > existing.updated_at()
                }
            };

            if old_wins {
                record.set_owner(new.clone());
                guard.insert(target_key, record);
                moved += 1;
            }
        }

        Ok(moved)
    }
}

#[async_trait]
impl QueueRepository for InMemoryStore {
    async fn upsert(
        &self,
        mutation: &ProgressMutation,
        now: DateTime<Utc>,
    ) -> Result<SyncQueueEntry, StorageError> {
        let mut guard = Self::lock(&self.queue)?;

        if let Some(entry) = guard.iter_mut().find(|e| {
            !e.failed
                && e.mutation.owner == mutation.owner
                && e.mutation.challenge_id == mutation.challenge_id
        }) {
            // Collapse: latest payload, original position, fresh retries.
            entry.mutation = mutation.clone();
            entry.attempt_count = 0;
            entry.last_attempt_at = None;
            entry.last_error = None;
            return Ok(entry.clone());
        }

        let entry = SyncQueueEntry {
            id: Uuid::new_v4(),
            mutation: mutation.clone(),
            enqueued_at: now,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            failed: false,
        };
        guard.push(entry.clone());
        Ok(entry)
    }

    async fn pending(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let guard = Self::lock(&self.queue)?;
        let mut entries: Vec<SyncQueueEntry> =
            guard.iter().filter(|e| !e.failed).cloned().collect();
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    async fn pending_count(&self) -> Result<u64, StorageError> {
        let guard = Self::lock(&self.queue)?;
        Ok(guard.iter().filter(|e| !e.failed).count() as u64)
    }

    async fn remove(&self, id: Uuid) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        guard.retain(|e| e.id != id);
        Ok(())
    }

    async fn remove_if_unchanged(
        &self,
        id: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        match guard
            .iter()
            .position(|e| e.id == id && e.mutation.updated_at == updated_at)
        {
            Some(pos) => {
                guard.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        let entry = guard
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::NotFound)?;
        entry.attempt_count += 1;
        entry.last_attempt_at = Some(at);
        entry.last_error = error.map(str::to_owned);
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        let entry = guard
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StorageError::NotFound)?;
        entry.failed = true;
        Ok(())
    }

    async fn failed(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let guard = Self::lock(&self.queue)?;
        let mut entries: Vec<SyncQueueEntry> =
            guard.iter().filter(|e| e.failed).cloned().collect();
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        let entry = guard
            .iter_mut()
            .find(|e| e.id == id && e.failed)
            .ok_or(StorageError::NotFound)?;
        entry.failed = false;
        entry.attempt_count = 0;
        entry.last_attempt_at = None;
        entry.last_error = None;
        entry.enqueued_at = now;
        Ok(())
    }

    async fn prune_failed(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        let before = guard.len();
        guard.retain(|e| !(e.failed && e.enqueued_at < cutoff));
        Ok((before - guard.len()) as u64)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let mut guard = Self::lock(&self.queue)?;
        let removed = guard.len() as u64;
        guard.clear();
        Ok(removed)
    }
}

#[async_trait]
impl SessionRepository for InMemoryStore {
    async fn current_anonymous(&self) -> Result<Option<AnonymousSessionId>, StorageError> {
        let guard = Self::lock(&self.session)?;
        Ok(guard.current)
    }

    async fn save_anonymous(&self, id: AnonymousSessionId) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.session)?;
        guard.current = Some(id);
        Ok(())
    }

    async fn mark_superseded(&self, id: AnonymousSessionId) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.session)?;
        guard.superseded.insert(id);
        if guard.current == Some(id) {
            guard.current = None;
        }
        Ok(())
    }

    async fn is_superseded(&self, id: AnonymousSessionId) -> Result<bool, StorageError> {
        let guard = Self::lock(&self.session)?;
        Ok(guard.superseded.contains(&id))
    }

    async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let guard = Self::lock(&self.session)?;
        Ok(guard.last_synced_at)
    }

    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut guard = Self::lock(&self.session)?;
        guard.last_synced_at = Some(at);
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use progress_core::model::{OptionId, UserId};
    use progress_core::time::fixed_now;

    fn anon_owner() -> OwnerKey {
        OwnerKey::Anonymous(AnonymousSessionId::mint())
    }

    fn record(owner: &OwnerKey, challenge: &str, option: &str, at: DateTime<Utc>) -> ProgressRecord {
        ProgressRecord::new(
            owner.clone(),
            ChallengeId::new(challenge),
            OptionId::new(option),
            true,
            at,
        )
    }

    fn mutation(owner: &OwnerKey, challenge: &str, option: &str) -> ProgressMutation {
        ProgressMutation::from_record(&record(owner, challenge, option, fixed_now()))
    }

    #[tokio::test]
    async fn put_upserts_in_place() {
        let store = InMemoryStore::new();
        let owner = anon_owner();

        store
            .put(&record(&owner, "c1", "o1", fixed_now()))
            .await
            .unwrap();
        store
            .put(&record(&owner, "c1", "o2", fixed_now() + Duration::seconds(1)))
            .await
            .unwrap();

        let records = store.list_by_owner(&owner).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].selected_option_id(), &OptionId::new("o2"));
    }

    #[tokio::test]
    async fn reassign_moves_unconflicted_records() {
        let store = InMemoryStore::new();
        let old = anon_owner();
        let new = OwnerKey::User(UserId::new("user-42"));

        store.put(&record(&old, "c1", "o1", fixed_now())).await.unwrap();
        store.put(&record(&old, "c2", "o2", fixed_now())).await.unwrap();

        let moved = store
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert!(store.list_by_owner(&old).await.unwrap().is_empty());
        assert_eq!(store.list_by_owner(&new).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reassign_is_idempotent() {
        let store = InMemoryStore::new();
        let old = anon_owner();
        let new = OwnerKey::User(UserId::new("user-42"));

        store.put(&record(&old, "c1", "o1", fixed_now())).await.unwrap();

        let first = store
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await
            .unwrap();
        let second = store
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(store.list_by_owner(&new).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reassign_prefer_newest_keeps_later_target() {
        let store = InMemoryStore::new();
        let old = anon_owner();
        let new = OwnerKey::User(UserId::new("user-42"));

        store.put(&record(&old, "c1", "o-anon", fixed_now())).await.unwrap();
        store
            .put(&record(&new, "c1", "o-user", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();

        let moved = store
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await
            .unwrap();
        assert_eq!(moved, 0);

        let records = store.list_by_owner(&new).await.unwrap();
        assert_eq!(records[0].selected_option_id(), &OptionId::new("o-user"));
        // The anonymous copy is consumed either way.
        assert!(store.list_by_owner(&old).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reassign_prefer_newest_overwrites_older_target() {
        let store = InMemoryStore::new();
        let old = anon_owner();
        let new = OwnerKey::User(UserId::new("user-42"));

        store
            .put(&record(&old, "c1", "o-anon", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();
        store.put(&record(&new, "c1", "o-user", fixed_now())).await.unwrap();

        let moved = store
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await
            .unwrap();
        assert_eq!(moved, 1);

        let records = store.list_by_owner(&new).await.unwrap();
        assert_eq!(records[0].selected_option_id(), &OptionId::new("o-anon"));
    }

    #[tokio::test]
    async fn reassign_tie_keeps_target() {
        let store = InMemoryStore::new();
        let old = anon_owner();
        let new = OwnerKey::User(UserId::new("user-42"));

        store.put(&record(&old, "c1", "o-anon", fixed_now())).await.unwrap();
        store.put(&record(&new, "c1", "o-user", fixed_now())).await.unwrap();

        store
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await
            .unwrap();

        let records = store.list_by_owner(&new).await.unwrap();
        assert_eq!(records[0].selected_option_id(), &OptionId::new("o-user"));
    }

    #[tokio::test]
    async fn queue_collapses_same_key_entries() {
        let store = InMemoryStore::new();
        let owner = anon_owner();

        let first = store
            .upsert(&mutation(&owner, "c1", "o1"), fixed_now())
            .await
            .unwrap();
        store
            .upsert(&mutation(&owner, "c2", "o1"), fixed_now() + Duration::seconds(1))
            .await
            .unwrap();
        let collapsed = store
            .upsert(&mutation(&owner, "c1", "o3"), fixed_now() + Duration::seconds(2))
            .await
            .unwrap();

        // Same id and enqueue position, latest payload.
        assert_eq!(collapsed.id, first.id);
        assert_eq!(collapsed.enqueued_at, first.enqueued_at);

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].mutation.challenge_id, ChallengeId::new("c1"));
        assert_eq!(
            pending[0].mutation.selected_option_id,
            OptionId::new("o3")
        );
    }

    #[tokio::test]
    async fn remove_if_unchanged_spares_collapsed_entries() {
        let store = InMemoryStore::new();
        let owner = anon_owner();

        let entry = store
            .upsert(&mutation(&owner, "c1", "o1"), fixed_now())
            .await
            .unwrap();
        let newer = ProgressMutation::from_record(&record(
            &owner,
            "c1",
            "o2",
            fixed_now() + Duration::minutes(1),
        ));
        store
            .upsert(&newer, fixed_now() + Duration::minutes(1))
            .await
            .unwrap();

        // The payload changed since `entry` was read, so it stays queued.
        assert!(
            !store
                .remove_if_unchanged(entry.id, entry.mutation.updated_at)
                .await
                .unwrap()
        );
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let current = store.pending().await.unwrap().remove(0);
        assert!(
            store
                .remove_if_unchanged(current.id, current.mutation.updated_at)
                .await
                .unwrap()
        );
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_entries_leave_the_pending_set() {
        let store = InMemoryStore::new();
        let owner = anon_owner();

        let entry = store
            .upsert(&mutation(&owner, "c1", "o1"), fixed_now())
            .await
            .unwrap();
        store
            .record_attempt(entry.id, fixed_now(), Some("http 500"))
            .await
            .unwrap();
        store.mark_failed(entry.id).await.unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 0);
        let failed = store.failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt_count, 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("http 500"));
    }

    #[tokio::test]
    async fn requeue_failed_resets_bookkeeping() {
        let store = InMemoryStore::new();
        let owner = anon_owner();

        let entry = store
            .upsert(&mutation(&owner, "c1", "o1"), fixed_now())
            .await
            .unwrap();
        store.record_attempt(entry.id, fixed_now(), None).await.unwrap();
        store.mark_failed(entry.id).await.unwrap();

        store
            .requeue_failed(entry.id, fixed_now() + Duration::minutes(1))
            .await
            .unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt_count, 0);
        assert!(store.failed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_discards_everything() {
        let store = InMemoryStore::new();
        let owner = anon_owner();

        let entry = store
            .upsert(&mutation(&owner, "c1", "o1"), fixed_now())
            .await
            .unwrap();
        store
            .upsert(&mutation(&owner, "c2", "o1"), fixed_now())
            .await
            .unwrap();
        store.mark_failed(entry.id).await.unwrap();

        assert_eq!(store.clear().await.unwrap(), 2);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.failed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_lifecycle_supersedes_once() {
        let store = InMemoryStore::new();
        let id = AnonymousSessionId::mint();

        assert!(store.current_anonymous().await.unwrap().is_none());
        store.save_anonymous(id).await.unwrap();
        assert_eq!(store.current_anonymous().await.unwrap(), Some(id));

        store.mark_superseded(id).await.unwrap();
        assert!(store.is_superseded(id).await.unwrap());
        assert!(store.current_anonymous().await.unwrap().is_none());
    }
}
