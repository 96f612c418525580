//! Plugin error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by storage plugin calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin call timed out after {0:?}")]
    Timeout(Duration),

    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    #[error("plugin call failed: {0}")]
    Rpc(String),

    #[error("no plugin registered for driver {0}")]
    UnknownDriver(String),
}

impl PluginError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PluginError::UnknownDriver(_))
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
