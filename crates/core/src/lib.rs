#![forbid(unsafe_code)]

pub mod model;
pub mod time;

pub use model::{
    AnonymousSessionId, CategoryProgress, ChallengeId, OptionId, OwnerKey, ProgressMutation,
    ProgressRecord, SyncState, TabId, UserId,
};
pub use time::Clock;
