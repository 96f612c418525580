//! Error types for the volgrid state store and volume registry.

use thiserror::Error;
use vol_core::{AvailabilityState, IllegalTransition, PublishStatus};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by [`crate::VolumeRegistry`] operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The request itself is wrong; retrying will not help.
    #[error("invalid volume spec: {0}")]
    InvalidSpec(String),

    #[error("volume {volume} is single-node and already held on {holder} ({status}); cannot publish to {node}")]
    ScopeConflict {
        volume: String,
        node: String,
        holder: String,
        status: PublishStatus,
    },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("volume {volume} on node {node}: cannot move publish status {from} -> {to}")]
    IllegalPublishTransition {
        volume: String,
        node: String,
        from: PublishStatus,
        to: PublishStatus,
    },

    #[error("volume {volume} is not available for new placements ({availability})")]
    VolumeNotAvailable {
        volume: String,
        availability: AvailabilityState,
    },

    #[error("volume {volume} is in use: {reason}")]
    VolumeInUse { volume: String, reason: String },

    #[error("volume not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for RegistryError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(key) => RegistryError::NotFound(key),
            other => RegistryError::State(other),
        }
    }
}
