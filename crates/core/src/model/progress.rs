use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ids::{ChallengeId, OptionId};
use super::owner::OwnerKey;

/// Where a record sits in the local-commit / server-confirm lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Written locally, not yet handed to the sync queue.
    LocalOnly,
    /// Queued for dispatch, awaiting server acknowledgement.
    PendingSync,
    /// Acknowledged by the server.
    Synced,
    /// Dispatch exhausted retries or hit a terminal failure.
    SyncFailed,
}

impl SyncState {
    /// True if the record still needs a (re-)dispatch to converge.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        matches!(self, SyncState::LocalOnly | SyncState::PendingSync)
    }

    /// Storage text form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::LocalOnly => "local-only",
            SyncState::PendingSync => "pending-sync",
            SyncState::Synced => "synced",
            SyncState::SyncFailed => "sync-failed",
        }
    }

    /// Parses the storage text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local-only" => Some(SyncState::LocalOnly),
            "pending-sync" => Some(SyncState::PendingSync),
            "synced" => Some(SyncState::Synced),
            "sync-failed" => Some(SyncState::SyncFailed),
            _ => None,
        }
    }
}

/// One challenge answer for one owner.
///
/// At most one record exists per `(owner, challenge_id)` pair; a later
/// answer for the same pair updates the record in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    owner: OwnerKey,
    challenge_id: ChallengeId,
    selected_option_id: OptionId,
    is_completed: bool,
    completed_at: Option<DateTime<Utc>>,
    sync_state: SyncState,
    updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Creates the record for a first answer.
    #[must_use]
    pub fn new(
        owner: OwnerKey,
        challenge_id: ChallengeId,
        selected_option_id: OptionId,
        is_completed: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner,
            challenge_id,
            selected_option_id,
            is_completed,
            completed_at: is_completed.then_some(now),
            sync_state: SyncState::LocalOnly,
            updated_at: now,
        }
    }

    /// Rebuilds a record from persisted fields without re-deriving anything.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_persisted(
        owner: OwnerKey,
        challenge_id: ChallengeId,
        selected_option_id: OptionId,
        is_completed: bool,
        completed_at: Option<DateTime<Utc>>,
        sync_state: SyncState,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            owner,
            challenge_id,
            selected_option_id,
            is_completed,
            completed_at,
            sync_state,
            updated_at,
        }
    }

    /// Applies a re-answer to this record.
    ///
    /// Updates the selected option and `updated_at`. Completion is latched:
    /// once completed, `completed_at` keeps its original value and
    /// `is_completed` never reverts, even for a later incorrect answer.
    /// The record drops back to `LocalOnly` until it is re-enqueued.
    pub fn record_answer(
        &mut self,
        selected_option_id: OptionId,
        is_completed: bool,
        now: DateTime<Utc>,
    ) {
        self.selected_option_id = selected_option_id;
        self.updated_at = now;
        self.sync_state = SyncState::LocalOnly;

        if is_completed && !self.is_completed {
            self.is_completed = true;
            self.completed_at = Some(now);
        }
    }

    /// Marks the record as handed to the sync queue.
    pub fn mark_pending(&mut self) {
        self.sync_state = SyncState::PendingSync;
    }

    /// Marks the record as acknowledged by the server.
    pub fn mark_synced(&mut self) {
        self.sync_state = SyncState::Synced;
    }

    /// Marks the record as terminally failed to sync.
    pub fn mark_failed(&mut self) {
        self.sync_state = SyncState::SyncFailed;
    }

    /// Re-keys the record to a new owner (migration).
    pub fn set_owner(&mut self, owner: OwnerKey) {
        self.owner = owner;
    }

    #[must_use]
    pub fn owner(&self) -> &OwnerKey {
        &self.owner
    }

    #[must_use]
    pub fn challenge_id(&self) -> &ChallengeId {
        &self.challenge_id
    }

    #[must_use]
    pub fn selected_option_id(&self) -> &OptionId {
        &self.selected_option_id
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Completion summary for a set of challenges, derived from local records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CategoryProgress {
    pub completed_count: usize,
    pub total: usize,
    pub per_challenge: HashMap<ChallengeId, bool>,
}

impl CategoryProgress {
    /// Derives the summary for `challenge_ids` from the owner's records.
    #[must_use]
    pub fn derive<'a>(
        challenge_ids: &[ChallengeId],
        records: impl IntoIterator<Item = &'a ProgressRecord>,
    ) -> Self {
        let mut per_challenge: HashMap<ChallengeId, bool> = challenge_ids
            .iter()
            .map(|id| (id.clone(), false))
            .collect();

        for record in records {
            if let Some(done) = per_challenge.get_mut(record.challenge_id()) {
                *done = record.is_completed();
            }
        }

        let completed_count = per_challenge.values().filter(|done| **done).count();
        Self {
            completed_count,
            total: challenge_ids.len(),
            per_challenge,
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
