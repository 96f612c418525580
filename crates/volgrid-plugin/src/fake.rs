//! In-process storage plugin with failure injection.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use volgrid_state::{NodeId, TopologySegment, Volume, VolumeId};

use crate::error::{PluginError, PluginResult};
use crate::plugin::{StoragePlugin, VolumeInfo};

/// A recorded plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Publish { volume_id: VolumeId, node_id: NodeId },
    Unpublish { volume_id: VolumeId, node_id: NodeId },
    VolumeInfo { volume_id: VolumeId },
}

#[derive(Default)]
struct FakePluginInner {
    log: Vec<FakeCall>,
    attached: BTreeSet<(VolumeId, NodeId)>,
    publish_failures: u32,
    unpublish_failures: u32,
    failure: Option<PluginError>,
    delay: Option<Duration>,
    capacity_bytes: Option<u64>,
    accessible_topology: Vec<TopologySegment>,
}

/// Storage plugin that keeps attachments in memory.
#[derive(Default)]
pub struct FakePlugin(Mutex<FakePluginInner>);

impl FakePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, FakePluginInner> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` publish calls.
    pub fn fail_publishes(&self, count: u32) {
        self.inner().publish_failures = count;
    }

    /// Fail the next `count` unpublish calls.
    pub fn fail_unpublishes(&self, count: u32) {
        self.inner().unpublish_failures = count;
    }

    /// Error returned by injected failures. Defaults to [`PluginError::Rpc`].
    pub fn set_failure(&self, error: PluginError) {
        self.inner().failure = Some(error);
    }

    /// Delay every publish and unpublish by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner().delay = delay;
    }

    pub fn set_volume_info(&self, capacity_bytes: Option<u64>, topology: Vec<TopologySegment>) {
        let mut inner = self.inner();
        inner.capacity_bytes = capacity_bytes;
        inner.accessible_topology = topology;
    }

    pub fn is_attached(&self, volume_id: &str, node_id: &str) -> bool {
        self.inner()
            .attached
            .contains(&(volume_id.to_string(), node_id.to_string()))
    }

    /// Nodes the volume is currently attached to.
    pub fn attached_nodes(&self, volume_id: &str) -> Vec<NodeId> {
        self.inner()
            .attached
            .iter()
            .filter(|(v, _)| v == volume_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn log(&self) -> Vec<FakeCall> {
        self.inner().log.clone()
    }

    pub fn publish_count(&self, volume_id: &str) -> usize {
        self.inner()
            .log
            .iter()
            .filter(|c| matches!(c, FakeCall::Publish { volume_id: v, .. } if v == volume_id))
            .count()
    }

    pub fn unpublish_count(&self, volume_id: &str) -> usize {
        self.inner()
            .log
            .iter()
            .filter(|c| matches!(c, FakeCall::Unpublish { volume_id: v, .. } if v == volume_id))
            .count()
    }

    fn delay(&self) -> Option<Duration> {
        self.inner().delay
    }

    fn injected_failure(inner: &mut FakePluginInner, publish: bool) -> Option<PluginError> {
        let remaining = if publish {
            &mut inner.publish_failures
        } else {
            &mut inner.unpublish_failures
        };
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(
            inner
                .failure
                .clone()
                .unwrap_or_else(|| PluginError::Rpc("injected failure".to_string())),
        )
    }
}

#[async_trait]
impl StoragePlugin for FakePlugin {
    async fn publish(&self, volume: &Volume, node_id: &str) -> PluginResult<()> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner();
        inner.log.push(FakeCall::Publish {
            volume_id: volume.id.clone(),
            node_id: node_id.to_string(),
        });
        if let Some(err) = Self::injected_failure(&mut inner, true) {
            return Err(err);
        }
        inner
            .attached
            .insert((volume.id.clone(), node_id.to_string()));
        info!(volume_id = %volume.id, %node_id, "fake plugin: published");
        Ok(())
    }

    async fn unpublish(&self, volume: &Volume, node_id: &str) -> PluginResult<()> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner();
        inner.log.push(FakeCall::Unpublish {
            volume_id: volume.id.clone(),
            node_id: node_id.to_string(),
        });
        if let Some(err) = Self::injected_failure(&mut inner, false) {
            return Err(err);
        }
        inner
            .attached
            .remove(&(volume.id.clone(), node_id.to_string()));
        info!(volume_id = %volume.id, %node_id, "fake plugin: unpublished");
        Ok(())
    }

    async fn volume_info(&self, volume: &Volume) -> PluginResult<VolumeInfo> {
        let mut inner = self.inner();
        inner.log.push(FakeCall::VolumeInfo {
            volume_id: volume.id.clone(),
        });
        Ok(VolumeInfo {
            capacity_bytes: inner.capacity_bytes,
            accessible_topology: inner.accessible_topology.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use volgrid_state::{
        AvailabilityState, CapacityRange, ScopeKind, SharingKind, VolumeSpec,
    };

    fn volume(id: &str) -> Volume {
        Volume {
            id: id.to_string(),
            spec: VolumeSpec {
                name: id.to_string(),
                group: None,
                driver: "csi.example".to_string(),
                scope: ScopeKind::SingleNode,
                sharing: SharingKind::Exclusive,
                capacity: CapacityRange::default(),
                labels: BTreeMap::new(),
            },
            availability: AvailabilityState::Active,
            publish_status: BTreeMap::new(),
            accessible_topology: Vec::new(),
            capacity_bytes: None,
            degraded: None,
            version: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn publish_and_unpublish_track_attachments() {
        let plugin = FakePlugin::new();
        let vol = volume("vol-1");

        plugin.publish(&vol, "n1").await.unwrap();
        assert!(plugin.is_attached("vol-1", "n1"));
        assert_eq!(plugin.attached_nodes("vol-1"), vec!["n1".to_string()]);

        plugin.unpublish(&vol, "n1").await.unwrap();
        // Idempotent.
        plugin.unpublish(&vol, "n1").await.unwrap();
        assert!(!plugin.is_attached("vol-1", "n1"));
        assert_eq!(plugin.unpublish_count("vol-1"), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let plugin = FakePlugin::new();
        let vol = volume("vol-1");
        plugin.fail_publishes(2);
        plugin.set_failure(PluginError::Unavailable("n1".to_string()));

        assert!(matches!(
            plugin.publish(&vol, "n1").await,
            Err(PluginError::Unavailable(_))
        ));
        assert!(plugin.publish(&vol, "n1").await.is_err());
        plugin.publish(&vol, "n1").await.unwrap();
        assert_eq!(plugin.publish_count("vol-1"), 3);
    }

    #[tokio::test]
    async fn volume_info_reports_configuration() {
        let plugin = FakePlugin::new();
        let segment: TopologySegment =
            [("zone".to_string(), "a".to_string())].into_iter().collect();
        plugin.set_volume_info(Some(1 << 30), vec![segment.clone()]);

        let info = plugin.volume_info(&volume("vol-1")).await.unwrap();
        assert_eq!(info.capacity_bytes, Some(1 << 30));
        assert_eq!(info.accessible_topology, vec![segment]);
    }
}
