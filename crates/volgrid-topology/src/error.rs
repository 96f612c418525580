//! Topology error types.

use thiserror::Error;
use volgrid_state::{IllegalTransition, StateError};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type TopologyResult<T> = Result<T, TopologyError>;
