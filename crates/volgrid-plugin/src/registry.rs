//! Driver name → plugin lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use volgrid_state::DriverInfo;

use crate::error::{PluginError, PluginResult};
use crate::plugin::StoragePlugin;

/// Resolves driver names and aliases to plugin implementations.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn StoragePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` under the driver's canonical name and every alias.
    pub fn register(&mut self, driver: &DriverInfo, plugin: Arc<dyn StoragePlugin>) {
        for name in std::iter::once(&driver.name).chain(driver.aliases.iter()) {
            self.plugins.insert(name.clone(), Arc::clone(&plugin));
        }
        debug!(driver = %driver.name, aliases = driver.aliases.len(), "storage plugin registered");
    }

    pub fn with_plugin(mut self, driver: &DriverInfo, plugin: Arc<dyn StoragePlugin>) -> Self {
        self.register(driver, plugin);
        self
    }

    pub fn get(&self, driver: &str) -> PluginResult<Arc<dyn StoragePlugin>> {
        self.plugins
            .get(driver)
            .cloned()
            .ok_or_else(|| PluginError::UnknownDriver(driver.to_string()))
    }

    pub fn contains(&self, driver: &str) -> bool {
        self.plugins.contains_key(driver)
    }
}
