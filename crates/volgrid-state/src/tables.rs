//! redb table definitions for the volgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Every table shares the same key/value shape.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Volumes keyed by `{volume_id}`.
pub const VOLUMES: JsonTable = TableDefinition::new("volumes");

/// Unique name index: `{volume_name}` → JSON string of the volume id.
pub const VOLUME_NAMES: JsonTable = TableDefinition::new("volume_names");

/// Node membership facts keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Storage drivers keyed by canonical `{driver_name}`.
pub const DRIVERS: JsonTable = TableDefinition::new("drivers");

/// Plugin interface facts keyed by `{node_id}:{driver_name}`.
pub const PLUGINS: JsonTable = TableDefinition::new("plugins");

/// Tasks that need a volume, keyed by `{task_id}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");
