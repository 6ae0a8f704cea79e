//! Progress façade: local-first answer submission, completion queries,
//! identity context, and the observable sync status.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use progress_core::model::{
    CategoryProgress, ChallengeId, OptionId, OwnerKey, ProgressMutation, UserId,
};
use progress_core::{Clock, ProgressRecord};
use storage::memory::InMemoryStore;
use storage::repository::{ProgressRepository, Storage};

use crate::broadcast::ProgressBroadcast;
use crate::error::ProgressServiceError;
use crate::migration::{MigrationReport, MigrationService};
use crate::observer::{Subject, Subscription};
use crate::queue::SyncQueueService;

/// Snapshot of the sync machinery for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// A drain pass is currently running.
    pub sync_in_progress: bool,
    /// Entries queued and awaiting acknowledgement.
    pub pending_count: u64,
    /// Entries parked in the failed bucket.
    pub failed_count: u64,
    /// An anonymous→authenticated migration is running.
    pub is_migrating: bool,
    /// Progress is held in memory only and will not survive a restart.
    pub storage_degraded: bool,
    /// When the queue last drained completely.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// The single entry point the learning UI talks to.
///
/// Answers commit to the local store first and are queued for dispatch;
/// submission itself never fails. When the durable store rejects a write
/// the service degrades to an in-memory overlay rather than losing the
/// answer, and reads merge the overlay over the durable store.
pub struct ProgressService {
    clock: Clock,
    storage: Storage,
    queue: Arc<SyncQueueService>,
    migration: MigrationService,
    broadcast: Option<Arc<ProgressBroadcast>>,
    identity: StdMutex<OwnerKey>,
    migrating: AtomicBool,
    overlay: InMemoryStore,
    overlay_active: AtomicBool,
    status_changes: Subject<SyncStatus>,
}

impl ProgressService {
    /// Build the service and establish the owner identity: the stored
    /// anonymous session if one is current, otherwise a freshly minted one.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError` if the session store fails.
    pub async fn new(
        clock: Clock,
        storage: Storage,
        queue: Arc<SyncQueueService>,
        migration: MigrationService,
    ) -> Result<Self, ProgressServiceError> {
        let session = match storage.sessions.current_anonymous().await? {
            Some(id) => id,
            None => {
                let id = progress_core::model::AnonymousSessionId::mint();
                storage.sessions.save_anonymous(id).await?;
                id
            }
        };

        Ok(Self {
            clock,
            storage,
            queue,
            migration,
            broadcast: None,
            identity: StdMutex::new(OwnerKey::Anonymous(session)),
            migrating: AtomicBool::new(false),
            overlay: InMemoryStore::new(),
            overlay_active: AtomicBool::new(false),
            status_changes: Subject::new(),
        })
    }

    /// Attach the cross-view broadcast endpoint.
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: Arc<ProgressBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// The owner all reads and writes are currently attributed to.
    #[must_use]
    pub fn current_owner(&self) -> OwnerKey {
        self.identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    // ─── Submission and queries ────────────────────────────────────────────────

    /// Record an answer. Commits locally, queues the mutation for dispatch,
    /// and announces the write to other views.
    ///
    /// This is deliberately infallible: a durable-store failure flips the
    /// service into the in-memory overlay instead of surfacing an error,
    /// so the learner's answer always lands.
    pub async fn submit_progress(
        &self,
        challenge_id: ChallengeId,
        selected_option_id: OptionId,
        is_completed: bool,
    ) -> ProgressRecord {
        let owner = self.current_owner();
        let now = self.clock.now();

        let mut record = match self.read_record(&owner, &challenge_id).await {
            Some(mut existing) => {
                existing.record_answer(selected_option_id, is_completed, now);
                existing
            }
            None => ProgressRecord::new(owner, challenge_id, selected_option_id, is_completed, now),
        };
        record.mark_pending();

        self.write_record(&record).await;

        if let Err(err) = self.queue.enqueue(&ProgressMutation::from_record(&record)).await {
            // The answer itself is safe; it just will not dispatch until a
            // later write re-queues it.
            tracing::warn!(
                challenge = %record.challenge_id(),
                error = %err,
                "failed to enqueue mutation"
            );
        }

        if let Some(broadcast) = &self.broadcast {
            broadcast.announce(&record);
        }

        self.publish_status().await;
        record
    }

    /// The stored record for one challenge, if any.
    pub async fn get_progress(
        &self,
        challenge_id: &ChallengeId,
    ) -> Option<ProgressRecord> {
        let owner = self.current_owner();
        self.read_record(&owner, challenge_id).await
    }

    /// Whether the current owner has ever completed the challenge.
    pub async fn is_challenge_completed(&self, challenge_id: &ChallengeId) -> bool {
        self.get_progress(challenge_id)
            .await
            .is_some_and(|record| record.is_completed())
    }

    /// Completion summary for a category's challenge list, derived from
    /// local records only.
    pub async fn get_category_progress(
        &self,
        challenge_ids: &[ChallengeId],
    ) -> CategoryProgress {
        let owner = self.current_owner();

        let mut records = match self.storage.progress.list_by_owner(&owner).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "progress read failed, using overlay only");
                Vec::new()
            }
        };

        if self.overlay_active.load(Ordering::SeqCst) {
            if let Ok(overlayed) = self.overlay.list_by_owner(&owner).await {
                for record in overlayed {
                    records.retain(|r| r.challenge_id() != record.challenge_id());
                    records.push(record);
                }
            }
        }

        CategoryProgress::derive(challenge_ids, records.iter())
    }

    // ─── Identity transitions ──────────────────────────────────────────────────

    /// Handle a sign-in: attribute future work to `user` and migrate the
    /// anonymous progress accumulated so far.
    ///
    /// Returns the migration report, or `None` when there was no anonymous
    /// identity to migrate.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError` if the migration sweep fails; the
    /// identity still switches to the user, and the sweep can be retried
    /// because the anonymous session was not consumed.
    pub async fn signed_in(
        &self,
        user: UserId,
    ) -> Result<Option<MigrationReport>, ProgressServiceError> {
        let previous = {
            let mut identity = self
                .identity
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let previous = identity.clone();
            *identity = OwnerKey::User(user.clone());
            previous
        };

        let OwnerKey::Anonymous(anon) = previous else {
            return Ok(None);
        };

        self.migrating.store(true, Ordering::SeqCst);
        self.publish_status().await;
        let result = self.migration.migrate(anon, &user).await;
        self.migrating.store(false, Ordering::SeqCst);
        self.publish_status().await;

        let report = result.map_err(ProgressServiceError::from)?;
        self.queue.request_drain();
        Ok(Some(report))
    }

    /// Handle a sign-out: mint a fresh anonymous identity. A superseded
    /// session id is never resurrected.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError` if the session store fails.
    pub async fn signed_out(&self) -> Result<OwnerKey, ProgressServiceError> {
        let session = progress_core::model::AnonymousSessionId::mint();
        self.storage.sessions.save_anonymous(session).await?;

        let owner = OwnerKey::Anonymous(session);
        *self
            .identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = owner.clone();
        Ok(owner)
    }

    // ─── Sync control and status ───────────────────────────────────────────────

    /// User-triggered sync attempt, including failed entries.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError` if the queue store fails.
    pub async fn force_sync(&self) -> Result<crate::queue::DrainReport, ProgressServiceError> {
        let report = self.queue.force_sync().await?;
        self.publish_status().await;
        Ok(report)
    }

    /// Discard all queued mutations (the caller confirms with the user).
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError` if the queue store fails.
    pub async fn clear_queue(&self) -> Result<u64, ProgressServiceError> {
        let removed = self.queue.clear_queue().await?;
        self.publish_status().await;
        Ok(removed)
    }

    /// Current snapshot of the sync machinery.
    pub async fn status(&self) -> SyncStatus {
        let pending_count = self.queue.pending_count().await.unwrap_or(0);
        let failed_count = self
            .queue
            .failed_entries()
            .await
            .map(|entries| entries.len() as u64)
            .unwrap_or(0);
        let last_synced_at = self.storage.sessions.last_synced_at().await.ok().flatten();

        SyncStatus {
            sync_in_progress: self.queue.is_draining(),
            pending_count,
            failed_count,
            is_migrating: self.migrating.load(Ordering::SeqCst),
            storage_degraded: self.storage.degraded
                || self.overlay_active.load(Ordering::SeqCst),
            last_synced_at,
        }
    }

    /// Listen for status snapshots emitted after state-changing operations.
    #[must_use]
    pub fn subscribe_status(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription<SyncStatus> {
        self.status_changes.subscribe(listener)
    }

    async fn publish_status(&self) {
        if self.status_changes.listener_count() == 0 {
            return;
        }
        let status = self.status().await;
        self.status_changes.emit(&status);
    }

    // ─── Store access with overlay fallback ────────────────────────────────────

    async fn read_record(
        &self,
        owner: &OwnerKey,
        challenge_id: &ChallengeId,
    ) -> Option<ProgressRecord> {
        if self.overlay_active.load(Ordering::SeqCst) {
            if let Ok(Some(record)) = self.overlay.get(owner, challenge_id).await {
                return Some(record);
            }
        }
        match self.storage.progress.get(owner, challenge_id).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "progress read failed");
                None
            }
        }
    }

    async fn write_record(&self, record: &ProgressRecord) {
        if let Err(err) = self.storage.progress.put(record).await {
            if !self.overlay_active.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    error = %err,
                    "durable store rejected a write, degrading to in-memory progress"
                );
            }
        } else if !self.overlay_active.load(Ordering::SeqCst) {
            return;
        }
        // Keep the overlay current once active so reads stay coherent.
        if let Err(err) = self.overlay.put(record).await {
            tracing::warn!(error = %err, "overlay write failed");
        }
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
    use progress_core::model::SyncState;
    use progress_core::time::fixed_clock;
    use storage::repository::StorageError;

    struct AlwaysAck;

    #[async_trait]
    impl ProgressTransport for AlwaysAck {
        async fn dispatch(
            &self,
            _mutation: &ProgressMutation,
        ) -> Result<DispatchAck, DispatchError> {
            Ok(DispatchAck::default())
        }
    }

    /// Progress store whose writes can be switched to fail.
    #[derive(Clone)]
    struct FlakyProgressStore {
        inner: InMemoryStore,
        fail_writes: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProgressRepository for FlakyProgressStore {
        async fn get(
            &self,
            owner: &OwnerKey,
            challenge_id: &ChallengeId,
        ) -> Result<Option<ProgressRecord>, StorageError> {
            self.inner.get(owner, challenge_id).await
        }

        async fn put(&self, record: &ProgressRecord) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Connection("disk full".into()));
            }
            self.inner.put(record).await
        }

        async fn list_by_owner(
            &self,
            owner: &OwnerKey,
        ) -> Result<Vec<ProgressRecord>, StorageError> {
            self.inner.list_by_owner(owner).await
        }

        async fn reassign_owner(
            &self,
            old: &OwnerKey,
            new: &OwnerKey,
            policy: storage::repository::ReassignPolicy,
        ) -> Result<u64, StorageError> {
            self.inner.reassign_owner(old, new, policy).await
        }
    }

    struct Fixture {
        service: ProgressService,
        fail_writes: Arc<AtomicBool>,
    }

    async fn fixture(online: bool) -> Fixture {
        let store = InMemoryStore::new();
        let fail_writes = Arc::new(AtomicBool::new(false));
        let flaky = FlakyProgressStore {
            inner: store.clone(),
            fail_writes: Arc::clone(&fail_writes),
        };

        let storage = Storage {
            progress: Arc::new(flaky),
            queue: Arc::new(store.clone()),
            sessions: Arc::new(store.clone()),
            degraded: false,
        };

        let queue = Arc::new(
            SyncQueueService::new(
                fixed_clock(),
                Arc::clone(&storage.queue),
                Arc::clone(&storage.progress),
                Arc::clone(&storage.sessions),
                Arc::new(AlwaysAck),
                Arc::new(NetworkMonitor::with_initial(online)),
            )
            .with_policy(RetryPolicy::immediate(3)),
        );
        let migration = MigrationService::new(
            Arc::clone(&storage.progress),
            Arc::clone(&storage.queue),
            Arc::clone(&storage.sessions),
            Arc::clone(&queue),
        );
        let service = ProgressService::new(fixed_clock(), storage, Arc::clone(&queue), migration)
            .await
            .unwrap();

        Fixture {
            service,
            fail_writes,
        }
    }

    #[tokio::test]
    async fn bootstrap_mints_and_reuses_anonymous_identity() {
        let f = fixture(false).await;
        let owner = f.service.current_owner();
        assert!(!owner.is_authenticated());

        // Writes are attributed to the bootstrapped identity.
        let record = f
            .service
            .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
            .await;
        assert_eq!(record.owner(), &owner);
    }

    #[tokio::test]
    async fn submit_commits_locally_and_queues() {
        let f = fixture(false).await;

        let record = f
            .service
            .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
            .await;
        assert_eq!(record.sync_state(), SyncState::PendingSync);

        let status = f.service.status().await;
        assert_eq!(status.pending_count, 1);
        assert!(f.service.is_challenge_completed(&ChallengeId::new("c1")).await);
    }

    #[tokio::test]
    async fn reanswer_updates_in_place_and_keeps_completion() {
        let f = fixture(false).await;
        let c = ChallengeId::new("c1");

        f.service
            .submit_progress(c.clone(), OptionId::new("right"), true)
            .await;
        f.service
            .submit_progress(c.clone(), OptionId::new("wrong"), false)
            .await;

        let record = f.service.get_progress(&c).await.unwrap();
        assert_eq!(record.selected_option_id().as_str(), "wrong");
        assert!(record.is_completed());

        // Two submissions for the same challenge collapse to one entry.
        assert_eq!(f.service.status().await.pending_count, 1);
    }

    #[tokio::test]
    async fn category_progress_counts_only_listed_challenges() {
        let f = fixture(false).await;
        f.service
            .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
            .await;
        f.service
            .submit_progress(ChallengeId::new("c2"), OptionId::new("o1"), false)
            .await;

        let ids = [ChallengeId::new("c1"), ChallengeId::new("c2"), ChallengeId::new("c3")];
        let progress = f.service.get_category_progress(&ids).await;
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.total, 3);
    }

    #[tokio::test]
    async fn write_failure_degrades_to_overlay_without_losing_the_answer() {
        let f = fixture(false).await;
        f.fail_writes.store(true, Ordering::SeqCst);

        let c = ChallengeId::new("c1");
        f.service
            .submit_progress(c.clone(), OptionId::new("o1"), true)
            .await;

        assert!(f.service.status().await.storage_degraded);
        assert!(f.service.is_challenge_completed(&c).await);

        let progress = f.service.get_category_progress(&[c]).await;
        assert_eq!(progress.completed_count, 1);
    }

    #[tokio::test]
    async fn sign_in_migrates_and_switches_identity() {
        let f = fixture(true).await;
        f.service
            .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
            .await;

        let report = f.service.signed_in(UserId::new("u1")).await.unwrap().unwrap();
        assert_eq!(report.migrated, 1);

        let owner = f.service.current_owner();
        assert!(owner.is_authenticated());
        assert!(f.service.is_challenge_completed(&ChallengeId::new("c1")).await);
    }

    #[tokio::test]
    async fn second_sign_in_has_nothing_to_migrate() {
        let f = fixture(true).await;
        f.service.signed_in(UserId::new("u1")).await.unwrap();

        let report = f.service.signed_in(UserId::new("u1")).await.unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn sign_out_mints_a_fresh_session() {
        let f = fixture(true).await;
        let before = f.service.current_owner();
        f.service.signed_in(UserId::new("u1")).await.unwrap();

        let after = f.service.signed_out().await.unwrap();
        assert!(!after.is_authenticated());
        assert_ne!(after, before);

        // The old session's progress is not visible to the new identity.
        assert!(!f.service.is_challenge_completed(&ChallengeId::new("c1")).await);
    }

    #[tokio::test]
    async fn status_listener_observes_pending_count() {
        let f = fixture(false).await;
        let seen: Arc<StdMutex<Vec<u64>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let _sub = f.service.subscribe_status(move |status| {
            sink.lock().unwrap().push(status.pending_count);
        });

        f.service
            .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
            .await;

        assert_eq!(seen.lock().unwrap().as_slice(), &[1]);
    }
}
