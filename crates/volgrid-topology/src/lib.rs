//! volgrid-topology: which nodes can reach a volume.
//!
//! Node and plugin facts arrive from the membership feed and are
//! persisted by the [`MembershipManager`]. The [`TopologyResolver`] reads
//! them back to answer, for one volume, the set of nodes that could
//! attach it right now.
//!
//! # Architecture
//!
//! ```text
//! NodeEvent / PluginEvent
//!   └── MembershipManager ──► StateStore (nodes, drivers, plugins)
//!                                  │
//! TopologyResolver ◄───────────────┘
//!   ├── node gate:       Ready + availability Active
//!   ├── plugin gate:     enabled, healthy `node` interface for the driver
//!   ├── locality gate:   volume accessible topology ∋ node segment
//!   └── controller gate: driver needs a reachable controller
//! ```

pub mod error;
pub mod membership;
pub mod resolver;

pub use error::{TopologyError, TopologyResult};
pub use membership::{MembershipManager, NodeChange, NodeEvent, PluginEvent};
pub use resolver::{Exclusion, TopologyResolver};
