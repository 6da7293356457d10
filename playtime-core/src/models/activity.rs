use serde::{Deserialize, Serialize};

use super::account::{AccountId, TitleId};

/// Profile visibility as reported by `communityvisibilitystate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    FriendsOnly,
    Public,
}

impl Visibility {
    /// 1 = private, 2 = friends only, 3 = public. Anything else is untrusted.
    pub fn from_code(code: i64) -> Self {
        match code {
            3 => Visibility::Public,
            2 => Visibility::FriendsOnly,
            _ => Visibility::Private,
        }
    }

    pub fn is_public(self) -> bool {
        self == Visibility::Public
    }
}

/// Per-tick snapshot of one account. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub account: AccountId,
    pub visibility: Visibility,
    pub current_title: TitleId,
    pub persona_name: Option<String>,
}

impl ActivitySummary {
    pub fn is_playing(&self) -> bool {
        !self.current_title.is_none()
    }
}

/// Cumulative playtime of one owned title, in whole minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedGame {
    pub title: TitleId,
    pub name: String,
    pub playtime_forever: u32,
}
