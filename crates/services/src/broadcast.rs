//! Cross-view progress broadcast.
//!
//! Every open view (tab) publishes its committed writes on a shared
//! channel. Views on the same device share one store, so a tab event only
//! refreshes the other views' in-memory state; a realtime event from
//! another device additionally needs the local store brought up to date.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use progress_core::model::TabId;
use progress_core::ProgressRecord;
use storage::repository::ProgressRepository;
use tokio::sync::Notify;

use crate::error::BroadcastError;
use crate::observer::{Subject, Subscription};

/// Where a broadcast event originated relative to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Another view on this device sharing the same local store.
    LocalTab,
    /// A realtime notification about a write made on another device.
    RemoteDevice,
}

/// One committed progress write, as seen on the broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// The view that produced the event (for echo suppression).
    pub origin: TabId,
    pub source: EventSource,
    pub record: ProgressRecord,
}

/// Transport for progress events between views.
pub trait BroadcastChannel: Send + Sync {
    /// Deliver an event to every subscribed view, including the sender.
    fn publish(&self, event: &ProgressEvent);

    /// Listen for events; the listener also receives the view's own echoes.
    fn subscribe(
        &self,
        listener: Box<dyn Fn(&ProgressEvent) + Send + Sync>,
    ) -> Subscription<ProgressEvent>;
}

/// In-process channel standing in for the platform's same-origin
/// view-to-view messaging. Clones share one bus.
#[derive(Clone, Default)]
pub struct LocalBroadcast {
    bus: Subject<ProgressEvent>,
}

impl LocalBroadcast {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BroadcastChannel for LocalBroadcast {
    fn publish(&self, event: &ProgressEvent) {
        self.bus.emit(event);
    }

    fn subscribe(
        &self,
        listener: Box<dyn Fn(&ProgressEvent) + Send + Sync>,
    ) -> Subscription<ProgressEvent> {
        self.bus.subscribe(move |event| listener(event))
    }
}

/// One view's endpoint on the broadcast channel.
///
/// Outbound: `announce` publishes this view's committed writes. Inbound:
/// the view's own echoes are dropped by origin id; tab events from other
/// views reach subscribers without touching the store (the originating
/// view already wrote it); remote-device events are additionally buffered
/// and applied to the store by `apply_inbound` (or the pump task), last
/// write wins by `updated_at`.
pub struct ProgressBroadcast {
    tab_id: TabId,
    channel: Arc<dyn BroadcastChannel>,
    progress: Arc<dyn ProgressRepository>,
    inbox: Arc<StdMutex<Vec<ProgressEvent>>>,
    inbox_wakeup: Arc<Notify>,
    updates: Arc<Subject<ProgressEvent>>,
    _incoming: Subscription<ProgressEvent>,
}

impl ProgressBroadcast {
    #[must_use]
    pub fn new(
        channel: Arc<dyn BroadcastChannel>,
        progress: Arc<dyn ProgressRepository>,
    ) -> Self {
        Self::with_tab_id(TabId::mint(), channel, progress)
    }

    #[must_use]
    pub fn with_tab_id(
        tab_id: TabId,
        channel: Arc<dyn BroadcastChannel>,
        progress: Arc<dyn ProgressRepository>,
    ) -> Self {
        let inbox: Arc<StdMutex<Vec<ProgressEvent>>> = Arc::default();
        let inbox_wakeup = Arc::new(Notify::new());
        let updates: Arc<Subject<ProgressEvent>> = Arc::new(Subject::new());

        let incoming = {
            let inbox = Arc::clone(&inbox);
            let inbox_wakeup = Arc::clone(&inbox_wakeup);
            let updates = Arc::clone(&updates);
            channel.subscribe(Box::new(move |event| {
                if event.origin == tab_id {
                    return;
                }
                if event.source == EventSource::RemoteDevice {
                    inbox
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(event.clone());
                    inbox_wakeup.notify_one();
                }
                updates.emit(event);
            }))
        };

        Self {
            tab_id,
            channel,
            progress,
            inbox,
            inbox_wakeup,
            updates,
            _incoming: incoming,
        }
    }

    #[must_use]
    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    /// Publish a write this view has committed to the local store.
    pub fn announce(&self, record: &ProgressRecord) {
        self.channel.publish(&ProgressEvent {
            origin: self.tab_id,
            source: EventSource::LocalTab,
            record: record.clone(),
        });
    }

    /// Feed a realtime notification from another device into the channel.
    ///
    /// Unlike a local write, the record did not originate in this view's
    /// store, so it is buffered for this view as well as published to the
    /// others.
    pub fn announce_remote(&self, record: &ProgressRecord) {
        let event = ProgressEvent {
            origin: self.tab_id,
            source: EventSource::RemoteDevice,
            record: record.clone(),
        };
        self.inbox
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
        self.inbox_wakeup.notify_one();
        self.channel.publish(&event);
    }

    /// Listen for events arriving from other origins (view refresh hook).
    #[must_use]
    pub fn subscribe(
        &self,
        listener: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> Subscription<ProgressEvent> {
        self.updates.subscribe(listener)
    }

    /// Apply buffered inbound events to the store. An event only overwrites
    /// a record that is not newer than it; a stale event is dropped.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError` if the progress store fails.
    pub async fn apply_inbound(&self) -> Result<usize, BroadcastError> {
        let events: Vec<ProgressEvent> = std::mem::take(
            &mut *self
                .inbox
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        let mut applied = 0;
        for event in events {
            let incoming = &event.record;
            let current = self
                .progress
                .get(incoming.owner(), incoming.challenge_id())
                .await?;
            if let Some(current) = &current {
                if current.updated_at() >= incoming.updated_at() {
                    continue;
                }
            }
            self.progress.put(incoming).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Run the inbound pump until the broadcast endpoint is dropped.
    pub fn spawn_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(broadcast) = this.upgrade() else {
                    break;
                };
                let wakeup = Arc::clone(&broadcast.inbox_wakeup);
                if let Err(err) = broadcast.apply_inbound().await {
                    tracing::warn!(error = %err, "failed to apply broadcast event");
                }
                drop(broadcast);
                wakeup.notified().await;
            }
        })
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
