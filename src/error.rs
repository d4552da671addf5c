//! Error types for agent-relay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cycle detected: message {0} is already in the ancestor chain")]
    CycleDetected(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Message expired: {0}")]
    Expired(String),

    #[error("Adapter at capacity")]
    CapacityExceeded { adapter: String },

    #[error("Delivery failure: {0}")]
    Delivery(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Plugin load error for '{id}': {reason}")]
    PluginLoad { id: String, reason: String },

    #[error("Trace recording error: {0}")]
    TraceRecording(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn plugin_load(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PluginLoad {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
