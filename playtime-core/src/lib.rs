pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod models;
pub mod source;
pub mod store;

pub use config::PlaytimeConfig;
pub use control::ControlMessage;
pub use error::PlaytimeError;
pub use models::{
    AccountId, ActiveSession, ActivitySummary, OwnedGame, Session, TitleId, TitleInfo,
    TrackedAccount, Visibility,
};
pub use source::{AccountActivitySource, SourceError, SteamClient};
pub use store::{PgStore, SessionStore, StoreError};
