//! End-to-end flows over the assembled sync context: offline answering,
//! reconnect drains, sign-in migration, failed-entry recovery, and
//! cross-view convergence.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use progress_core::model::{ChallengeId, OptionId, OwnerKey, ProgressMutation, SyncState, UserId};
use progress_core::time::fixed_clock;
use services::{
    BroadcastChannel, DispatchAck, DispatchError, LocalBroadcast, NetworkMonitor,
    ProgressTransport, RetryPolicy, SyncContext,
};
use storage::repository::Storage;

/// Scripted server stand-in: acknowledges by default, fails on demand,
/// and records every mutation it saw in dispatch order.
#[derive(Default)]
struct FakeServer {
    dispatched: Mutex<Vec<ProgressMutation>>,
    failures: Mutex<Vec<(ChallengeId, DispatchError)>>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_next(&self, challenge: &str, error: DispatchError) {
        self.failures
            .lock()
            .unwrap()
            .push((ChallengeId::new(challenge), error));
    }

    fn dispatched(&self) -> Vec<ProgressMutation> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressTransport for FakeServer {
    async fn dispatch(&self, mutation: &ProgressMutation) -> Result<DispatchAck, DispatchError> {
        self.dispatched.lock().unwrap().push(mutation.clone());
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures
            .iter()
            .position(|(id, _)| *id == mutation.challenge_id)
        {
            let (_, error) = failures.remove(pos);
            return Err(error);
        }
        Ok(DispatchAck::default())
    }
}

struct World {
    storage: Storage,
    server: Arc<FakeServer>,
    monitor: Arc<NetworkMonitor>,
    channel: Arc<dyn BroadcastChannel>,
}

impl World {
    fn new(online: bool) -> Self {
        Self {
            storage: Storage::in_memory(),
            server: FakeServer::new(),
            monitor: Arc::new(NetworkMonitor::with_initial(online)),
            channel: Arc::new(LocalBroadcast::new()),
        }
    }

    async fn open_view(&self) -> SyncContext {
        SyncContext::assemble(
            fixed_clock(),
            self.storage.clone(),
            self.server.clone(),
            Arc::clone(&self.monitor),
            Arc::clone(&self.channel),
            RetryPolicy::immediate(3),
        )
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn offline_answer_syncs_after_reconnect() {
    let world = World::new(false);
    let ctx = world.open_view().await;
    let progress = ctx.progress();

    let record = progress
        .submit_progress(ChallengeId::new("phishing-01"), OptionId::new("opt-b"), true)
        .await;
    assert_eq!(record.sync_state(), SyncState::PendingSync);
    assert!(!record.owner().is_authenticated());

    // Offline: nothing reaches the server, the answer is visible locally.
    assert!(world.server.dispatched().is_empty());
    assert!(progress.is_challenge_completed(&ChallengeId::new("phishing-01")).await);

    world.monitor.set_online(true);
    ctx.queue().drain().await.unwrap();

    let dispatched = world.server.dispatched();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].owner, progress.current_owner());

    let synced = progress
        .get_progress(&ChallengeId::new("phishing-01"))
        .await
        .unwrap();
    assert_eq!(synced.sync_state(), SyncState::Synced);
    assert_eq!(progress.status().await.pending_count, 0);
}

#[tokio::test]
async fn reanswer_while_queued_dispatches_only_the_latest() {
    let world = World::new(false);
    let ctx = world.open_view().await;
    let progress = ctx.progress();
    let c = ChallengeId::new("c1");

    progress
        .submit_progress(c.clone(), OptionId::new("first"), false)
        .await;
    progress
        .submit_progress(c.clone(), OptionId::new("second"), true)
        .await;

    world.monitor.set_online(true);
    ctx.queue().drain().await.unwrap();

    let dispatched = world.server.dispatched();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].selected_option_id.as_str(), "second");
    assert!(dispatched[0].is_completed);
}

#[tokio::test]
async fn sign_in_migrates_and_dispatches_under_the_user() {
    let world = World::new(false);
    let ctx = world.open_view().await;
    let progress = ctx.progress();

    progress
        .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
        .await;
    progress
        .submit_progress(ChallengeId::new("c2"), OptionId::new("o2"), false)
        .await;

    world.monitor.set_online(true);
    let report = progress
        .signed_in(UserId::new("user-7"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.migrated, 2);
    assert_eq!(report.requeued, 2);

    ctx.queue().drain().await.unwrap();

    let user = OwnerKey::User(UserId::new("user-7"));
    for mutation in world.server.dispatched() {
        assert_eq!(mutation.owner, user);
    }

    // Completion carries over to the signed-in identity.
    assert!(progress.is_challenge_completed(&ChallengeId::new("c1")).await);

    // A second sign-in for the same flow migrates nothing.
    let again = progress.signed_in(UserId::new("user-7")).await.unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn exhausted_entry_recovers_through_force_sync() {
    let world = World::new(true);
    let ctx = world.open_view().await;
    let progress = ctx.progress();
    let c = ChallengeId::new("c1");

    for _ in 0..3 {
        world
            .server
            .fail_next("c1", DispatchError::Network("http 503".into()));
    }
    progress
        .submit_progress(c.clone(), OptionId::new("o1"), true)
        .await;

    for _ in 0..3 {
        ctx.queue().drain().await.unwrap();
    }

    let status = progress.status().await;
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.failed_count, 1);
    let record = progress.get_progress(&c).await.unwrap();
    assert_eq!(record.sync_state(), SyncState::SyncFailed);

    // The outage is over; a user-triggered sync brings the entry back.
    let report = progress.force_sync().await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(progress.status().await.failed_count, 0);
    let record = progress.get_progress(&c).await.unwrap();
    assert_eq!(record.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn clear_queue_keeps_local_progress() {
    let world = World::new(false);
    let ctx = world.open_view().await;
    let progress = ctx.progress();
    let c = ChallengeId::new("c1");

    progress
        .submit_progress(c.clone(), OptionId::new("o1"), true)
        .await;
    let removed = progress.clear_queue().await.unwrap();
    assert_eq!(removed, 1);

    world.monitor.set_online(true);
    ctx.queue().drain().await.unwrap();
    assert!(world.server.dispatched().is_empty());

    // The local record survives; only the dispatch was discarded.
    assert!(progress.is_challenge_completed(&c).await);
}

#[tokio::test]
async fn second_view_sees_the_first_views_write() {
    let world = World::new(false);
    let view_a = world.open_view().await;
    let view_b = world.open_view().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = view_b.broadcast().subscribe(move |event| {
        sink.lock()
            .unwrap()
            .push(event.record.challenge_id().clone());
    });

    view_a
        .progress()
        .submit_progress(ChallengeId::new("c1"), OptionId::new("o1"), true)
        .await;

    assert_eq!(seen.lock().unwrap().as_slice(), &[ChallengeId::new("c1")]);
    // Same-device views share the store, so a tab event leaves nothing
    // for the receiving view to apply.
    assert_eq!(view_b.broadcast().apply_inbound().await.unwrap(), 0);
}
