//! volgrid-state: volume registry and embedded state store.
//!
//! Backed by [redb](https://docs.rs/redb), holds volumes, nodes, storage
//! drivers, per-node plugin facts, and tasks that need a volume.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every mutation of an existing record is a read-modify-write inside one
//! write transaction, and redb admits a single writer at a time, so
//! concurrent publish decisions for the same volume are linearized.
//!
//! ```text
//! VolumeRegistry
//!   ├── validation (driver capabilities, availability, publish lifecycle)
//!   ├── broadcast::Sender<VolumeEvent>  (watch stream for control loops)
//!   └── StateStore (redb)
//!       ├── volumes / volume_names
//!       ├── nodes / drivers / plugins
//!       └── tasks
//! ```

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult, StateError, StateResult};
pub use registry::{VolumeEvent, VolumeRegistry};
pub use store::{StateStore, Updated};
pub use types::*;
