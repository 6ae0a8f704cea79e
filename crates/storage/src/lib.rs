#![forbid(unsafe_code)]

pub mod memory;
pub mod repository;
pub mod sqlite;

pub use repository::{
    ProgressRepository, QueueRepository, ReassignPolicy, SessionRepository, Storage, StorageError,
    SyncQueueEntry,
};
