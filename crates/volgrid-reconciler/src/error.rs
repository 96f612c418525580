//! Reconciler error types.

use thiserror::Error;

use vol_core::RequirementError;
use volgrid_placement::ConstraintError;
use volgrid_plugin::PluginError;
use volgrid_state::{RegistryError, StateError};
use volgrid_topology::TopologyError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("invalid volume requirement: {0}")]
    Requirement(#[from] RequirementError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
