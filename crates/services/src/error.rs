//! Shared error types for the services crate.

use thiserror::Error;

use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by `SyncQueueService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncQueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while applying broadcast events to the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BroadcastError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `MigrationService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MigrationError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] SyncQueueError),
}

/// Errors emitted by `ProgressService`.
///
/// Submitting an answer deliberately has no fatal failure mode: a local
/// write failure degrades to the in-memory overlay instead of erroring.
/// These variants cover identity bootstrap and migration orchestration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] SyncQueueError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Errors emitted while assembling a `SyncContext`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncContextError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Progress(#[from] ProgressServiceError),
}
