use thiserror::Error;

use crate::source::SourceError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PlaytimeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Activity source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
