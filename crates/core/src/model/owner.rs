use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{AnonymousSessionId, ParseIdError, UserId};

/// The identity a progress record currently belongs to.
///
/// Exactly one owner per record at any time: either the pre-sign-in
/// anonymous session or the authenticated user. Migration re-keys records
/// from `Anonymous` to `User`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OwnerKey {
    Anonymous(AnonymousSessionId),
    User(UserId),
}

impl OwnerKey {
    /// True if this owner is an authenticated user.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, OwnerKey::User(_))
    }

    /// The authenticated user id, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            OwnerKey::User(id) => Some(id),
            OwnerKey::Anonymous(_) => None,
        }
    }

    /// The anonymous session id, if any.
    #[must_use]
    pub fn anonymous_id(&self) -> Option<AnonymousSessionId> {
        match self {
            OwnerKey::Anonymous(id) => Some(*id),
            OwnerKey::User(_) => None,
        }
    }
}

impl From<AnonymousSessionId> for OwnerKey {
    fn from(id: AnonymousSessionId) -> Self {
        OwnerKey::Anonymous(id)
    }
}

impl From<UserId> for OwnerKey {
    fn from(id: UserId) -> Self {
        OwnerKey::User(id)
    }
}

impl fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKey::Anonymous(id) => write!(f, "OwnerKey::Anonymous({id})"),
            OwnerKey::User(id) => write!(f, "OwnerKey::User({id})"),
        }
    }
}

// Storage-friendly text form: "anon:<uuid>" or "user:<id>".

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKey::Anonymous(id) => write!(f, "anon:{id}"),
            OwnerKey::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for OwnerKey {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("anon:") {
            return rest.parse::<AnonymousSessionId>().map(OwnerKey::Anonymous);
        }
        if let Some(rest) = s.strip_prefix("user:") {
            return rest.parse::<UserId>().map(OwnerKey::User);
        }
        Err(ParseIdError::for_kind("OwnerKey"))
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
