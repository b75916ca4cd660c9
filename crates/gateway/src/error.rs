//! Gateway error types.

use thiserror::Error;

use crate::client::ConnectionId;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Cell store or update channel error.
    #[error("Store error: {0}")]
    Store(#[from] grid_store::Error),

    /// Sending to a single connection failed.
    #[error("Send to connection {0} failed")]
    SendFailed(ConnectionId),

    /// A fanout loop is already attached to this registry.
    #[error("Fanout loop already running for topic '{0}'")]
    FanoutAlreadyRunning(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
