//! Constraint evaluation errors.

use thiserror::Error;
use volgrid_state::{RegistryError, StateError};
use volgrid_topology::TopologyError;

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("no eligible node for {requirement}")]
    NoEligibleNode { requirement: String },

    #[error("volume {volume} not available: {reason}")]
    VolumeNotAvailable { volume: String, reason: String },

    #[error("no usable volume left in group {group}")]
    GroupExhausted { group: String },

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ConstraintError {
    /// Transient conditions the reconciler retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConstraintError::NoEligibleNode { .. }
                | ConstraintError::VolumeNotAvailable { .. }
                | ConstraintError::GroupExhausted { .. }
        )
    }
}

pub type ConstraintResult<T> = Result<T, ConstraintError>;
