#![forbid(unsafe_code)]

pub mod broadcast;
pub mod error;
pub mod migration;
pub mod network;
pub mod observer;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod sync_context;
pub mod transport;

pub use progress_core::Clock;

pub use broadcast::{
    BroadcastChannel, EventSource, LocalBroadcast, ProgressBroadcast, ProgressEvent,
};
pub use error::{
    BroadcastError, MigrationError, ProgressServiceError, SyncContextError, SyncQueueError,
};
pub use migration::{MigrationReport, MigrationService};
pub use network::{AlwaysOnlineProbe, ConnectivityProbe, NetworkMonitor};
pub use observer::{Subject, Subscription};
pub use progress::{ProgressService, SyncStatus};
pub use queue::{DrainReport, QueueEvent, RetryPolicy, SyncQueueService};
pub use scheduler::SyncScheduler;
pub use sync_context::SyncContext;
pub use transport::{DispatchAck, DispatchError, HttpTransport, ProgressTransport};
