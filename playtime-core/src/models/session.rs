use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::{AccountId, TitleId};

/// A play session believed to be in progress. At most one per (account, title).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub account: AccountId,
    pub title: TitleId,
    pub started_at: DateTime<Utc>,
    /// Platform counter for `title` at or before `started_at`, in minutes.
    pub baseline_playtime: u32,
}

/// A finished, append-only session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account: AccountId,
    pub title: TitleId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub playtime_forever_at_end: u32,
}

impl Session {
    pub fn duration_minutes(&self) -> i64 {
        (self.ended_at - self.started_at).num_minutes()
    }
}
