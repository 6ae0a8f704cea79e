//! Anonymous→authenticated migration: a one-shot sweep that re-keys
//! local progress to the signed-in user and re-queues anything unsynced.

use std::sync::Arc;

use progress_core::model::{AnonymousSessionId, OwnerKey, ProgressMutation, SyncState, UserId};
use storage::repository::{
    ProgressRepository, QueueRepository, ReassignPolicy, SessionRepository,
};

use crate::error::MigrationError;
use crate::queue::SyncQueueService;

/// Summary of one migration sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records now keyed to the authenticated owner as a result of the sweep.
    pub migrated: u64,
    /// Challenges where both owners held a record and one had to win.
    pub conflicts: u32,
    /// Unsynced records re-queued under the authenticated owner.
    pub requeued: u32,
    /// True when the session was already consumed and nothing ran.
    pub already_migrated: bool,
}

/// Re-keys an anonymous session's progress to an authenticated user.
///
/// The sweep is idempotent: a session is marked superseded only after the
/// whole sweep succeeds, and a superseded session short-circuits to a
/// no-op. A sweep interrupted by an error can simply be run again.
pub struct MigrationService {
    progress: Arc<dyn ProgressRepository>,
    queue_store: Arc<dyn QueueRepository>,
    sessions: Arc<dyn SessionRepository>,
    queue: Arc<SyncQueueService>,
}

impl MigrationService {
    #[must_use]
    pub fn new(
        progress: Arc<dyn ProgressRepository>,
        queue_store: Arc<dyn QueueRepository>,
        sessions: Arc<dyn SessionRepository>,
        queue: Arc<SyncQueueService>,
    ) -> Self {
        Self {
            progress,
            queue_store,
            sessions,
            queue,
        }
    }

    /// Move all records under the anonymous session to the user.
    ///
    /// Collisions resolve last-write-wins by `updated_at`; on an exact tie
    /// the record already under the authenticated owner is kept. Records
    /// that still need syncing are re-queued under their new owner, and
    /// queue entries still carrying the old identity are dropped.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if any store operation fails; the session
    /// is then left unconsumed so the sweep can be retried.
    pub async fn migrate(
        &self,
        anon: AnonymousSessionId,
        user: &UserId,
    ) -> Result<MigrationReport, MigrationError> {
        if self.sessions.is_superseded(anon).await? {
            tracing::debug!(session = %anon, "migration skipped, session already consumed");
            return Ok(MigrationReport {
                already_migrated: true,
                ..MigrationReport::default()
            });
        }

        let old = OwnerKey::Anonymous(anon);
        let new = OwnerKey::User(user.clone());
        let mut report = MigrationReport::default();

        // Surface collisions before the re-key sweep resolves them.
        for record in self.progress.list_by_owner(&old).await? {
            if let Some(existing) = self
                .progress
                .get(&new, record.challenge_id())
                .await?
            {
                report.conflicts += 1;
                let anonymous_wins = record.updated_at() > existing.updated_at();
                tracing::info!(
                    challenge = %record.challenge_id(),
                    anonymous_updated_at = %record.updated_at(),
                    user_updated_at = %existing.updated_at(),
                    winner = if anonymous_wins { "anonymous" } else { "authenticated" },
                    "migration conflict"
                );
            }
        }

        // Queue entries still keyed to the old owner carry a superseded
        // identity; their payloads are re-enqueued below under the new one.
        for entry in self.queue_store.pending().await? {
            if entry.mutation.owner == old {
                self.queue_store.remove(entry.id).await?;
            }
        }
        for entry in self.queue_store.failed().await? {
            if entry.mutation.owner == old {
                self.queue_store.remove(entry.id).await?;
            }
        }

        report.migrated = self
            .progress
            .reassign_owner(&old, &new, ReassignPolicy::PreferNewest)
            .await?;

        // Anything not yet confirmed by the server goes back through the
        // queue under the new owner; failed records get a fresh round under
        // the new identity.
        for mut record in self.progress.list_by_owner(&new).await? {
            if record.sync_state() == SyncState::Synced {
                continue;
            }
            record.mark_pending();
            self.progress.put(&record).await?;
            self.queue
                .enqueue(&ProgressMutation::from_record(&record))
                .await?;
            report.requeued += 1;
        }

        // Consume the session last so an interrupted sweep stays retryable.
        self.sessions.mark_superseded(anon).await?;

        tracing::info!(
            session = %anon,
            user = %user,
            migrated = report.migrated,
            conflicts = report.conflicts,
            requeued = report.requeued,
            "anonymous progress migrated"
        );
        Ok(report)
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use crate::queue::RetryPolicy;
    use crate::transport::{DispatchAck, DispatchError, ProgressTransport};
    use async_trait::async_trait;
    use chrono::Duration;
    use progress_core::model::{ChallengeId, OptionId, SyncState};
    use progress_core::time::{fixed_clock, fixed_now};
    use progress_core::ProgressRecord;
    use storage::memory::InMemoryStore;

    struct NeverDispatch;

    #[async_trait]
    impl ProgressTransport for NeverDispatch {
        async fn dispatch(
            &self,
            _mutation: &progress_core::model::ProgressMutation,
        ) -> Result<DispatchAck, DispatchError> {
            Err(DispatchError::Network("unused".into()))
        }
    }

    struct Fixture {
        store: InMemoryStore,
        queue: Arc<SyncQueueService>,
        migration: MigrationService,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let queue = Arc::new(
            SyncQueueService::new(
                fixed_clock(),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(NeverDispatch),
                Arc::new(NetworkMonitor::with_initial(false)),
            )
            .with_policy(RetryPolicy::immediate(3)),
        );
        let migration = MigrationService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::clone(&queue),
        );
        Fixture {
            store,
            queue,
            migration,
        }
    }

    async fn put(store: &InMemoryStore, record: &ProgressRecord) {
        ProgressRepository::put(store, record).await.unwrap();
    }

    fn rec(owner: &OwnerKey, challenge: &str, option: &str, at: chrono::DateTime<chrono::Utc>) -> ProgressRecord {
        ProgressRecord::new(
            owner.clone(),
            ChallengeId::new(challenge),
            OptionId::new(option),
            true,
            at,
        )
    }

    #[tokio::test]
    async fn migrates_all_anonymous_records() {
        let f = fixture();
        let anon = AnonymousSessionId::mint();
        let old = OwnerKey::Anonymous(anon);
        let user = UserId::new("u1");
        put(&f.store, &rec(&old, "c1", "o1", fixed_now())).await;
        put(&f.store, &rec(&old, "c2", "o2", fixed_now())).await;

        let report = f.migration.migrate(anon, &user).await.unwrap();
        assert_eq!(report.migrated, 2);
        assert_eq!(report.conflicts, 0);
        assert!(!report.already_migrated);

        let new = OwnerKey::User(user);
        let moved = ProgressRepository::list_by_owner(&f.store, &new)
            .await
            .unwrap();
        assert_eq!(moved.len(), 2);
        assert!(ProgressRepository::list_by_owner(&f.store, &old)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn repeated_migration_is_a_noop() {
        let f = fixture();
        let anon = AnonymousSessionId::mint();
        let old = OwnerKey::Anonymous(anon);
        let user = UserId::new("u1");
        put(&f.store, &rec(&old, "c1", "o1", fixed_now())).await;

        let first = f.migration.migrate(anon, &user).await.unwrap();
        assert_eq!(first.migrated, 1);

        let second = f.migration.migrate(anon, &user).await.unwrap();
        assert!(second.already_migrated);
        assert_eq!(second.migrated, 0);

        let new = OwnerKey::User(user);
        assert_eq!(
            ProgressRepository::list_by_owner(&f.store, &new)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn conflict_resolves_by_updated_at() {
        let f = fixture();
        let anon = AnonymousSessionId::mint();
        let old = OwnerKey::Anonymous(anon);
        let user = UserId::new("u1");
        let new = OwnerKey::User(user.clone());

        // Anonymous answer is newer for c1, older for c2.
        put(&f.store, &rec(&old, "c1", "anon-new", fixed_now())).await;
        put(
            &f.store,
            &rec(&new, "c1", "user-old", fixed_now() - Duration::hours(1)),
        )
        .await;
        put(
            &f.store,
            &rec(&old, "c2", "anon-old", fixed_now() - Duration::hours(1)),
        )
        .await;
        put(&f.store, &rec(&new, "c2", "user-new", fixed_now())).await;

        let report = f.migration.migrate(anon, &user).await.unwrap();
        assert_eq!(report.conflicts, 2);

        let c1 = ProgressRepository::get(&f.store, &new, &ChallengeId::new("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c1.selected_option_id().as_str(), "anon-new");

        let c2 = ProgressRepository::get(&f.store, &new, &ChallengeId::new("c2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c2.selected_option_id().as_str(), "user-new");
    }

    #[tokio::test]
    async fn timestamp_tie_keeps_authenticated_record() {
        let f = fixture();
        let anon = AnonymousSessionId::mint();
        let old = OwnerKey::Anonymous(anon);
        let user = UserId::new("u1");
        let new = OwnerKey::User(user.clone());

        put(&f.store, &rec(&old, "c1", "from-anon", fixed_now())).await;
        put(&f.store, &rec(&new, "c1", "from-user", fixed_now())).await;

        f.migration.migrate(anon, &user).await.unwrap();

        let winner = ProgressRepository::get(&f.store, &new, &ChallengeId::new("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner.selected_option_id().as_str(), "from-user");
    }

    #[tokio::test]
    async fn stale_anonymous_queue_entries_are_dropped() {
        let f = fixture();
        let anon = AnonymousSessionId::mint();
        let old = OwnerKey::Anonymous(anon);
        let user = UserId::new("u1");

        // Queued while anonymous, never dispatched (offline).
        let mut rec = rec(&old, "c1", "o1", fixed_now());
        rec.mark_pending();
        put(&f.store, &rec).await;
        f.queue
            .enqueue(&ProgressMutation::from_record(&rec))
            .await
            .unwrap();

        f.migration.migrate(anon, &user).await.unwrap();

        // Every remaining entry carries the authenticated owner.
        let pending = storage::repository::QueueRepository::pending(&f.store)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mutation.owner, OwnerKey::User(user));
    }

    #[tokio::test]
    async fn unsynced_records_are_requeued_under_new_owner() {
        let f = fixture();
        let anon = AnonymousSessionId::mint();
        let old = OwnerKey::Anonymous(anon);
        let user = UserId::new("u1");

        // One record the server never confirmed, one already synced.
        put(&f.store, &rec(&old, "c1", "o1", fixed_now())).await;
        let mut synced = rec(&old, "c2", "o2", fixed_now());
        synced.mark_synced();
        put(&f.store, &synced).await;

        let report = f.migration.migrate(anon, &user).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(f.queue.pending_count().await.unwrap(), 1);

        let new = OwnerKey::User(user);
        let c1 = ProgressRepository::get(&f.store, &new, &ChallengeId::new("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c1.sync_state(), SyncState::PendingSync);
        // The queued payload carries the authenticated owner.
        let pending = storage::repository::QueueRepository::pending(&f.store)
            .await
            .unwrap();
        assert_eq!(pending[0].mutation.owner, new);
    }
}
