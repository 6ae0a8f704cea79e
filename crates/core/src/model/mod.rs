pub mod ids;
pub mod mutation;
pub mod owner;
pub mod progress;

pub use ids::{AnonymousSessionId, ChallengeId, OptionId, ParseIdError, TabId, UserId};
pub use mutation::ProgressMutation;
pub use owner::OwnerKey;
pub use progress::{CategoryProgress, ProgressRecord, SyncState};
