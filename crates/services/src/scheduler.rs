//! Background drain loop: reacts to reconnects and drain requests, and
//! polls periodically so backed-off entries get their next attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::network::NetworkMonitor;
use crate::queue::SyncQueueService;

/// Owns the background task that keeps the queue moving.
pub struct SyncScheduler {
    queue: Arc<SyncQueueService>,
    monitor: Arc<NetworkMonitor>,
    poll_interval: Duration,
}

impl SyncScheduler {
    #[must_use]
    pub fn new(queue: Arc<SyncQueueService>, monitor: Arc<NetworkMonitor>) -> Self {
        Self {
            queue,
            monitor,
            poll_interval: Duration::from_secs(30),
        }
    }

    /// How often to re-check the queue while online (retry backoffs elapse
    /// between polls).
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the drain loop. It runs until the returned handle is aborted.
    ///
    /// Drains fire on the offline→online transition, on explicit drain
    /// requests (enqueue, sign-in, force-sync), and on the poll timer when
    /// entries are waiting.
    #[must_use]
    pub fn start(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let monitor = Arc::clone(&self.monitor);
        let poll_interval = self.poll_interval;

        // The transition listener only nudges the loop; the drain itself
        // always runs on the scheduler task.
        let nudge = Arc::clone(&self.queue);
        let transition_sub = monitor.subscribe(move |online| {
            if *online {
                nudge.request_drain();
            }
        });

        tokio::spawn(async move {
            let _transition_sub = transition_sub;
            loop {
                tokio::select! {
                    () = queue.drain_requested() => {}
                    () = tokio::time::sleep(poll_interval) => {
                        match queue.pending_count().await {
                            Ok(0) => continue,
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "queue poll failed");
                                continue;
                            }
                        }
                    }
                }

                if !monitor.is_online() {
                    continue;
                }
                if let Err(err) = queue.drain().await {
                    tracing::warn!(error = %err, "scheduled drain failed");
                }
            }
        })
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
