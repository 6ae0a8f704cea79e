//! Wires the sync machinery together behind one injectable handle.

use std::sync::Arc;

use progress_core::Clock;
use storage::repository::Storage;

use crate::broadcast::{BroadcastChannel, LocalBroadcast, ProgressBroadcast};
use crate::error::SyncContextError;
use crate::migration::MigrationService;
use crate::network::{ConnectivityProbe, NetworkMonitor};
use crate::progress::ProgressService;
use crate::queue::{RetryPolicy, SyncQueueService};
use crate::scheduler::SyncScheduler;
use crate::transport::ProgressTransport;

/// Assembles clock, storage, monitor, queue, migration, broadcast, and the
/// progress façade for one view.
///
/// Every collaborator is injected, so tests swap in fixed clocks, in-memory
/// stores, scripted transports, or a shared local broadcast bus.
#[derive(Clone)]
pub struct SyncContext {
    monitor: Arc<NetworkMonitor>,
    queue: Arc<SyncQueueService>,
    broadcast: Arc<ProgressBroadcast>,
    progress: Arc<ProgressService>,
}

impl SyncContext {
    /// Build a context over `SQLite` storage, falling back to in-memory
    /// operation when the database cannot be opened.
    ///
    /// # Errors
    ///
    /// Returns `SyncContextError` if service construction fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        transport: Arc<dyn ProgressTransport>,
        probe: &dyn ConnectivityProbe,
    ) -> Result<Self, SyncContextError> {
        let storage = Storage::sqlite_or_memory(db_url).await;
        Self::assemble(
            clock,
            storage,
            transport,
            Arc::new(NetworkMonitor::new(probe)),
            Arc::new(LocalBroadcast::new()),
            RetryPolicy::default(),
        )
        .await
    }

    /// Build a context from explicit parts (tests, demos, multi-view setups
    /// sharing one `channel`).
    ///
    /// # Errors
    ///
    /// Returns `SyncContextError` if service construction fails.
    pub async fn assemble(
        clock: Clock,
        storage: Storage,
        transport: Arc<dyn ProgressTransport>,
        monitor: Arc<NetworkMonitor>,
        channel: Arc<dyn BroadcastChannel>,
        policy: RetryPolicy,
    ) -> Result<Self, SyncContextError> {
        let queue = Arc::new(
            SyncQueueService::new(
                clock,
                Arc::clone(&storage.queue),
                Arc::clone(&storage.progress),
                Arc::clone(&storage.sessions),
                transport,
                Arc::clone(&monitor),
            )
            .with_policy(policy),
        );

        let migration = MigrationService::new(
            Arc::clone(&storage.progress),
            Arc::clone(&storage.queue),
            Arc::clone(&storage.sessions),
            Arc::clone(&queue),
        );

        let broadcast = Arc::new(ProgressBroadcast::new(
            channel,
            Arc::clone(&storage.progress),
        ));

        let progress = Arc::new(
            ProgressService::new(clock, storage, Arc::clone(&queue), migration)
                .await?
                .with_broadcast(Arc::clone(&broadcast)),
        );

        Ok(Self {
            monitor,
            queue,
            broadcast,
            progress,
        })
    }

    /// Start the background drain loop and the broadcast inbound pump.
    #[must_use]
    pub fn start_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let scheduler = SyncScheduler::new(Arc::clone(&self.queue), Arc::clone(&self.monitor));
        vec![scheduler.start(), self.broadcast.spawn_pump()]
    }

    #[must_use]
    pub fn monitor(&self) -> Arc<NetworkMonitor> {
        Arc::clone(&self.monitor)
    }

    #[must_use]
    pub fn queue(&self) -> Arc<SyncQueueService> {
        Arc::clone(&self.queue)
    }

    #[must_use]
    pub fn broadcast(&self) -> Arc<ProgressBroadcast> {
        Arc::clone(&self.broadcast)
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ProgressService> {
        Arc::clone(&self.progress)
    }
}
