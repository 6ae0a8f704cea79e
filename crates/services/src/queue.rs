//! Persisted sync queue: ordered dispatch of pending mutations with
//! per-owner serialization, bounded retries, and a failed bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use progress_core::model::{ChallengeId, OwnerKey, ProgressMutation};
use progress_core::Clock;
use rand::Rng;
use storage::repository::{
    ProgressRepository, QueueRepository, SessionRepository, SyncQueueEntry,
};
use tokio::sync::{Mutex, Notify};

use crate::error::SyncQueueError;
use crate::network::NetworkMonitor;
use crate::observer::{Subject, Subscription};
use crate::transport::{DispatchError, ProgressTransport};

/// Retry behavior knobs. Policy, not contract: every field is injectable.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before an entry moves to the failed bucket.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound for the doubling delay.
    pub max_delay: Duration,
    /// Per-attempt bound on waiting for the transport.
    pub dispatch_timeout: Duration,
    /// Fractional jitter applied to each delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with no delays, for deterministic tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            dispatch_timeout: Duration::from_secs(10),
            jitter: 0.0,
        }
    }

    /// Backoff delay before the next attempt, given attempts so far.
    #[must_use]
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }
        let exp = attempt_count.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exp);
        let capped = base.min(self.max_delay);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        capped.mul_f64(factor)
    }

    fn is_due(&self, entry: &SyncQueueEntry, now: DateTime<Utc>) -> bool {
        let Some(last) = entry.last_attempt_at else {
            return true;
        };
        let delay = self.backoff_delay(entry.attempt_count);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => last + delay <= now,
            Err(_) => false,
        }
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries acknowledged by the server and removed.
    pub acknowledged: u32,
    /// Entries that failed retryably and stay queued.
    pub retried: u32,
    /// Entries moved to the failed bucket this pass.
    pub failed: u32,
    /// Entries skipped because their backoff has not elapsed, their owner
    /// hit an earlier retryable failure, or connectivity dropped mid-pass.
    pub deferred: u32,
}

/// Observable queue lifecycle events for the status surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    DrainStarted,
    Acknowledged { challenge_id: ChallengeId },
    RetryScheduled { challenge_id: ChallengeId, attempt: u32 },
    Failed { challenge_id: ChallengeId, terminal: bool },
    DrainFinished(DrainReport),
    Cleared { removed: u64 },
}

enum DispatchOutcome {
    Acknowledged,
    Retrying,
    MovedToFailed,
    /// A newer mutation collapsed into the entry while it was in flight;
    /// the acknowledgement covers only the old payload.
    Superseded,
}

/// Drives queued mutations to the transport.
///
/// Per entry: `queued → dispatching → acknowledged | back to queued |
/// failed bucket`. Entries for one owner dispatch strictly in enqueue
/// order; an entry is never left dispatching (each attempt is bounded by
/// `RetryPolicy::dispatch_timeout`).
pub struct SyncQueueService {
    clock: Clock,
    queue: Arc<dyn QueueRepository>,
    progress: Arc<dyn ProgressRepository>,
    sessions: Arc<dyn SessionRepository>,
    transport: Arc<dyn ProgressTransport>,
    monitor: Arc<NetworkMonitor>,
    policy: RetryPolicy,
    drain_lock: Mutex<()>,
    draining: AtomicBool,
    drain_requests: Notify,
    events: Subject<QueueEvent>,
}

impl SyncQueueService {
    #[must_use]
    pub fn new(
        clock: Clock,
        queue: Arc<dyn QueueRepository>,
        progress: Arc<dyn ProgressRepository>,
        sessions: Arc<dyn SessionRepository>,
        transport: Arc<dyn ProgressTransport>,
        monitor: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            clock,
            queue,
            progress,
            sessions,
            transport,
            monitor,
            policy: RetryPolicy::default(),
            drain_lock: Mutex::new(()),
            draining: AtomicBool::new(false),
            drain_requests: Notify::new(),
            events: Subject::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// True while a drain pass is running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Listen for queue lifecycle events.
    #[must_use]
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueueEvent) + Send + Sync + 'static,
    ) -> Subscription<QueueEvent> {
        self.events.subscribe(listener)
    }

    /// Queue a mutation for dispatch, collapsing with any queued entry for
    /// the same `(owner, challenge)` pair.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue store fails.
    pub async fn enqueue(
        &self,
        mutation: &ProgressMutation,
    ) -> Result<SyncQueueEntry, SyncQueueError> {
        let entry = self.queue.upsert(mutation, self.clock.now()).await?;
        self.drain_requests.notify_one();
        Ok(entry)
    }

    /// Wake whoever is waiting to run a drain pass.
    pub fn request_drain(&self) {
        self.drain_requests.notify_one();
    }

    /// Completes when a drain has been requested (scheduler integration).
    pub async fn drain_requested(&self) {
        self.drain_requests.notified().await;
    }

    /// Number of entries still awaiting acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue store fails.
    pub async fn pending_count(&self) -> Result<u64, SyncQueueError> {
        Ok(self.queue.pending_count().await?)
    }

    /// Entries in the failed bucket, for the status surface.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue store fails.
    pub async fn failed_entries(&self) -> Result<Vec<SyncQueueEntry>, SyncQueueError> {
        Ok(self.queue.failed().await?)
    }

    /// Drop failed entries older than `max_age` (maintenance).
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue store fails.
    pub async fn prune_failed(&self, max_age: chrono::Duration) -> Result<u64, SyncQueueError> {
        Ok(self.queue.prune_failed(self.clock.now() - max_age).await?)
    }

    /// Dispatch all due entries, FIFO per owner. No-op while offline.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue or progress store fails;
    /// transport failures are absorbed into the retry state machine.
    pub async fn drain(&self) -> Result<DrainReport, SyncQueueError> {
        self.drain_inner(false).await
    }

    /// User-triggered sync: failed entries are re-queued for one more round
    /// and backoff eligibility is ignored.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue or progress store fails.
    pub async fn force_sync(&self) -> Result<DrainReport, SyncQueueError> {
        let now = self.clock.now();
        for entry in self.queue.failed().await? {
            self.queue.requeue_failed(entry.id, now).await?;
        }
        self.drain_inner(true).await
    }

    /// Discard all queued and failed entries without dispatching.
    ///
    /// Destructive: unsynced progress is lost. Callers own the
    /// confirm-before-clearing interaction.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if the queue store fails.
    pub async fn clear_queue(&self) -> Result<u64, SyncQueueError> {
        let removed = self.queue.clear().await?;
        if removed > 0 {
            tracing::warn!(removed, "sync queue cleared, unsynced progress discarded");
        }
        self.events.emit(&QueueEvent::Cleared { removed });
        Ok(removed)
    }

    async fn drain_inner(&self, ignore_backoff: bool) -> Result<DrainReport, SyncQueueError> {
        if !self.monitor.is_online() {
            return Ok(DrainReport::default());
        }

        let _guard = self.drain_lock.lock().await;
        self.draining.store(true, Ordering::SeqCst);
        self.events.emit(&QueueEvent::DrainStarted);
        let result = self.drain_locked(ignore_backoff).await;
        self.draining.store(false, Ordering::SeqCst);
        if let Ok(report) = &result {
            self.events.emit(&QueueEvent::DrainFinished(report.clone()));
        }
        result
    }

    async fn drain_locked(&self, ignore_backoff: bool) -> Result<DrainReport, SyncQueueError> {
        let mut report = DrainReport::default();

        // Group FIFO entries per owner; order within each owner is the
        // ordering guarantee, order across owners follows first enqueue.
        let mut per_owner: Vec<(OwnerKey, Vec<SyncQueueEntry>)> = Vec::new();
        for entry in self.queue.pending().await? {
            let owner = entry.mutation.owner.clone();
            match per_owner.iter_mut().find(|(key, _)| *key == owner) {
                Some((_, entries)) => entries.push(entry),
                None => per_owner.push((owner, vec![entry])),
            }
        }

        for (_owner, entries) in per_owner {
            let mut remaining = entries.len() as u32;
            for entry in entries {
                if !self.monitor.is_online() {
                    // Connectivity dropped mid-pass; the rest waits.
                    report.deferred += remaining;
                    return Ok(report);
                }
                if !ignore_backoff && !self.policy.is_due(&entry, self.clock.now()) {
                    // A not-yet-due entry blocks its owner's later entries,
                    // preserving per-owner order.
                    report.deferred += remaining;
                    break;
                }

                remaining -= 1;
                match self.dispatch_entry(&entry).await? {
                    DispatchOutcome::Acknowledged => report.acknowledged += 1,
                    DispatchOutcome::MovedToFailed => report.failed += 1,
                    DispatchOutcome::Retrying => {
                        report.retried += 1;
                        report.deferred += remaining;
                        break;
                    }
                    DispatchOutcome::Superseded => {
                        // The entry stays queued with its new payload and
                        // keeps its position, so its owner's later entries
                        // wait for the next pass.
                        report.deferred += remaining + 1;
                        break;
                    }
                }
            }
        }

        if report.acknowledged > 0
            && report.retried == 0
            && self.queue.pending_count().await? == 0
        {
            self.sessions.set_last_synced_at(self.clock.now()).await?;
        }

        Ok(report)
    }

    async fn dispatch_entry(
        &self,
        entry: &SyncQueueEntry,
    ) -> Result<DispatchOutcome, SyncQueueError> {
        let attempt_at = self.clock.now();
        let dispatched = tokio::time::timeout(
            self.policy.dispatch_timeout,
            self.transport.dispatch(&entry.mutation),
        )
        .await
        .unwrap_or(Err(DispatchError::Timeout));

        match dispatched {
            Ok(_ack) => {
                // The ack covers the payload we dispatched. If a newer
                // mutation collapsed into the entry while the transport was
                // in flight, the entry must stay queued for that payload.
                let removed = self
                    .queue
                    .remove_if_unchanged(entry.id, entry.mutation.updated_at)
                    .await?;
                if !removed {
                    self.request_drain();
                    return Ok(DispatchOutcome::Superseded);
                }
                self.reconcile(&entry.mutation, true).await?;
                self.events.emit(&QueueEvent::Acknowledged {
                    challenge_id: entry.mutation.challenge_id.clone(),
                });
                Ok(DispatchOutcome::Acknowledged)
            }
            Err(err) => {
                let attempts = entry.attempt_count + 1;
                self.queue
                    .record_attempt(entry.id, attempt_at, Some(&err.to_string()))
                    .await?;

                let exhausted = attempts >= self.policy.max_attempts;
                if !err.is_retryable() || exhausted {
                    tracing::warn!(
                        challenge = %entry.mutation.challenge_id,
                        attempts,
                        error = %err,
                        terminal = !err.is_retryable(),
                        "dispatch failed permanently, entry moved to failed bucket"
                    );
                    self.queue.mark_failed(entry.id).await?;
                    self.reconcile(&entry.mutation, false).await?;
                    self.events.emit(&QueueEvent::Failed {
                        challenge_id: entry.mutation.challenge_id.clone(),
                        terminal: !err.is_retryable(),
                    });
                    Ok(DispatchOutcome::MovedToFailed)
                } else {
                    tracing::debug!(
                        challenge = %entry.mutation.challenge_id,
                        attempts,
                        error = %err,
                        "dispatch failed, will retry"
                    );
                    self.events.emit(&QueueEvent::RetryScheduled {
                        challenge_id: entry.mutation.challenge_id.clone(),
                        attempt: attempts,
                    });
                    Ok(DispatchOutcome::Retrying)
                }
            }
        }
    }

    /// Reflect a dispatch outcome back onto the local record, unless a
    /// newer local write has superseded the dispatched payload.
    async fn reconcile(
        &self,
        mutation: &ProgressMutation,
        synced: bool,
    ) -> Result<(), SyncQueueError> {
        let Some(mut record) = self
            .progress
            .get(&mutation.owner, &mutation.challenge_id)
            .await?
        else {
            return Ok(());
        };

        if record.updated_at() != mutation.updated_at {
            return Ok(());
        }

        if synced {
            record.mark_synced();
        } else {
            record.mark_failed();
        }
        self.progress.put(&record).await?;
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
