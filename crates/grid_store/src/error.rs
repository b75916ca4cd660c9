//! Error types for the grid store.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Backing store unreachable or a command failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    #[error("Invalid coordinate: ({row},{column})")]
    InvalidCoordinate { row: i64, column: i64 },

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscription to '{0}' closed")]
    SubscriptionClosed(String),

    #[error("Malformed update event: {0}")]
    MalformedEvent(String),

    #[error("Malformed cell key: {0}")]
    MalformedKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;
