//! The `StoragePlugin` trait.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use volgrid_state::{TopologySegment, Volume};

use crate::error::{PluginError, PluginResult};

/// What a plugin reports about a provisioned volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub capacity_bytes: Option<u64>,
    /// Segments from which the volume is reachable; empty means anywhere.
    pub accessible_topology: Vec<TopologySegment>,
}

/// Storage driver operations the scheduler depends on.
///
/// Implementations must be idempotent: publishing an already published
/// volume, or unpublishing one that is already detached, succeeds.
#[async_trait]
pub trait StoragePlugin: Send + Sync {
    /// Attach `volume` to `node_id`.
    async fn publish(&self, volume: &Volume, node_id: &str) -> PluginResult<()>;

    /// Detach `volume` from `node_id`.
    async fn unpublish(&self, volume: &Volume, node_id: &str) -> PluginResult<()>;

    /// Capacity and locality of `volume`.
    async fn volume_info(&self, volume: &Volume) -> PluginResult<VolumeInfo>;
}

/// Run a plugin call, converting an elapsed deadline into [`PluginError::Timeout`].
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(PluginError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_plugin_error() {
        let result: PluginResult<()> = call_with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(PluginError::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn completed_call_passes_through() {
        let result = call_with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(PluginError::Rpc("boom".to_string()))
        })
        .await;
        assert!(matches!(result, Err(PluginError::Rpc(_))));
    }
}
