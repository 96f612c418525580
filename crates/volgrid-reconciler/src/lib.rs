//! volgrid-reconciler: control loops that keep volume publication in
//! step with task placement.
//!
//! # Architecture
//!
//! ```text
//!  node feed ──► node loop ─────┐
//!  plugin feed ─► plugin loop ──┤ write store, notify
//!  task feed ──► task loop ─────┤
//!  registry watch ► volume loop ┘
//!                                 │
//!                                 ▼
//!                       reconcile worker (tick + notify)
//!                                 │
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!     ConstraintEvaluator   ResourceScheduler    StoragePlugin calls
//!     (which volumes,       (which node)         (publish / unpublish,
//!      which nodes)                               bounded + retried)
//! ```
//!
//! Only the worker mutates publication state, so passes never interleave.
//! [`VolumeService`] is the operator and orchestrator entry point.

pub mod backoff;
pub mod error;
pub mod loops;
pub mod reconciler;
pub mod service;

pub use backoff::RetryTracker;
pub use error::{ReconcileError, ReconcileResult};
pub use loops::{FeedSenders, Feeds, LoopIntervals, ReconcilerHandle, TaskEvent, feeds, spawn_control_loops};
pub use reconciler::{PassSummary, PluginOp, Reconciler, ReconcilerSettings};
pub use service::VolumeService;
