//! Error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CruncherError>;

#[derive(Debug, Error)]
pub enum CruncherError {
    /// Caller supplied a missing or inconsistent range/filter
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A fold or the batch commit failed; the watermark was left untouched
    #[error("Aggregation failed: {0}")]
    AggregationFailure(#[source] sqlx::Error),

    /// The busy flag is held and could not be won; needs an explicit reset
    #[error("Busy flag held since {locked_at:?} (epoch millis); an administrative unlock is required")]
    StuckLock { locked_at: Option<i64> },

    /// A setting or deployment prerequisite that makes the operation impossible
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CruncherError {
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }
}
