//! Caller identity: an opaque id, a group, and an escalation rank.

use serde::{Deserialize, Serialize};

/// Highest rank an identity can be constructed with.
pub const MAX_RANK: u32 = 100;

/// An abstract caller (user id, API key, IP address, ...).
///
/// The `unique_id` keys the per-identity endpoint records; `group` partitions
/// rule applicability; `rank` indexes into the rule ladder and escalates when
/// offending rules fire. The persisted copy in the ranking store wins over the
/// request-derived candidate on every request, so rank survives across
/// requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub unique_id: String,
    pub group: String,
    #[serde(default)]
    pub rank: u32,
}

impl Identity {
    /// A fresh identity at rank 0.
    pub fn new(unique_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            group: group.into(),
            rank: 0,
        }
    }

    /// Override the starting rank, clamped to [`MAX_RANK`].
    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank.min(MAX_RANK);
        self
    }
}
