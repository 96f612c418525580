//! volgrid-plugin: the storage plugin seam.
//!
//! The scheduler never talks to storage directly. Every attach or detach
//! goes through a [`StoragePlugin`] looked up by driver name in the
//! [`PluginRegistry`]. Calls are bounded by [`call_with_timeout`] so a
//! wedged plugin surfaces as a retryable [`PluginError::Timeout`].
//!
//! # Architecture
//!
//! ```text
//! PluginRegistry
//!   ├── "csi.example"  ──► Arc<dyn StoragePlugin>
//!   ├── "example"      ──► (alias, same plugin)
//!   └── ...
//!
//! StoragePlugin
//!   ├── publish(volume, node)
//!   ├── unpublish(volume, node)
//!   └── volume_info(volume) → VolumeInfo { capacity, accessible topology }
//! ```
//!
//! [`fake::FakePlugin`] is an in-process implementation with failure
//! injection, used by tests across the workspace.

pub mod error;
pub mod fake;
pub mod plugin;
pub mod registry;

pub use error::{PluginError, PluginResult};
pub use plugin::{StoragePlugin, VolumeInfo, call_with_timeout};
pub use registry::PluginRegistry;
