pub mod account;
pub mod activity;
pub mod session;

pub use account::{AccountId, TitleId, TitleInfo, TrackedAccount};
pub use activity::{ActivitySummary, OwnedGame, Visibility};
pub use session::{ActiveSession, Session};
