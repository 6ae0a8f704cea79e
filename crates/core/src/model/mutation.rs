use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ChallengeId, OptionId};
use super::owner::OwnerKey;
use super::progress::ProgressRecord;

/// Wire payload handed to the remote persistence collaborator.
///
/// Carries the latest answer for one `(owner, challenge)` pair. The sync
/// queue collapses same-key entries, so at most one mutation per pair is
/// in flight at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMutation {
    pub owner: OwnerKey,
    pub challenge_id: ChallengeId,
    pub selected_option_id: OptionId,
    pub is_completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProgressMutation {
    /// Builds the dispatch payload for a record's current state.
    #[must_use]
    pub fn from_record(record: &ProgressRecord) -> Self {
        Self {
            owner: record.owner().clone(),
            challenge_id: record.challenge_id().clone(),
            selected_option_id: record.selected_option_id().clone(),
            is_completed: record.is_completed(),
            updated_at: record.updated_at(),
        }
    }
}
