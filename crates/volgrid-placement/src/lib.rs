//! volgrid-placement: turns a task's volume requirement into placement constraints.
//!
//! The evaluator does not pick nodes. It answers which (volume, node-set)
//! pairs could satisfy a task; a [`ResourceScheduler`] then chooses the
//! node and [`VolumePlacement::bind`] chooses the concrete volume for it.
//!
//! # Components
//!
//! - **`evaluator`**: `ConstraintEvaluator` (direct reference, group selector,
//!   single-node rule, sharing compatibility)
//! - **`placement`**: `VolumePlacement` result with predicate and binding
//! - **`scheduler`**: `ResourceScheduler` seam and the `FirstFit` default

pub mod error;
pub mod evaluator;
pub mod placement;
pub mod scheduler;

pub use error::{ConstraintError, ConstraintResult};
pub use evaluator::ConstraintEvaluator;
pub use placement::{Candidate, VolumePlacement};
pub use scheduler::{FirstFit, ResourceScheduler};
