//! Domain types for the volgrid state store.
//!
//! These types represent the persisted state of volumes, nodes, storage
//! drivers, plugin facts, and tasks. All types are serializable to/from
//! JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use vol_core::{
    AvailabilityState, IllegalTransition, MountMode, NodeId, PublishStatus, ScopeKind, ServiceId,
    SharingKind, TaskId, TopologySegment, Transition, VolumeId, VolumeRequirement, VolumeSource,
    VolumeUsage, topology_accessible,
};

// ── Volume ─────────────────────────────────────────────────────────

/// User-supplied description of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeSpec {
    /// Unique, user-assigned name.
    pub name: String,
    /// Interchangeability group; `None` or empty means ungrouped.
    pub group: Option<String>,
    /// Storage driver name or alias.
    pub driver: String,
    pub scope: ScopeKind,
    pub sharing: SharingKind,
    pub capacity: CapacityRange,
    pub labels: BTreeMap<String, String>,
}

/// Requested capacity bounds in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    pub required_bytes: Option<u64>,
    pub limit_bytes: Option<u64>,
}

/// A registered cluster volume and its observed attachment state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: VolumeId,
    pub spec: VolumeSpec,
    pub availability: AvailabilityState,
    /// Node-id → attachment state. Absent entries read as `NotPublished`.
    pub publish_status: BTreeMap<NodeId, PublishStatus>,
    /// Plugin-reported locality; empty means reachable anywhere.
    pub accessible_topology: Vec<TopologySegment>,
    /// Plugin-reported provisioned capacity.
    pub capacity_bytes: Option<u64>,
    /// Set after repeated plugin failures.
    pub degraded: Option<String>,
    /// Bumped on every committed change.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Volume {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn driver(&self) -> &str {
        &self.spec.driver
    }

    /// The group, if set and non-empty.
    pub fn group(&self) -> Option<&str> {
        self.spec.group.as_deref().filter(|g| !g.is_empty())
    }

    pub fn status_on(&self, node_id: &str) -> PublishStatus {
        self.publish_status
            .get(node_id)
            .copied()
            .unwrap_or(PublishStatus::NotPublished)
    }

    /// The node (other than `except`) that still has the volume attached in any form.
    pub fn attached_elsewhere(&self, except: &str) -> Option<(&NodeId, PublishStatus)> {
        self.publish_status
            .iter()
            .find(|(node, status)| node.as_str() != except && status.is_attached())
            .map(|(node, status)| (node, *status))
    }

    /// The node holding a `PublishPending`/`Published` reservation, if any.
    pub fn reserved_holder(&self) -> Option<&NodeId> {
        self.publish_status
            .iter()
            .find(|(_, status)| status.is_reserved())
            .map(|(node, _)| node)
    }

    pub fn is_fully_unpublished(&self) -> bool {
        self.publish_status.values().all(|s| !s.is_attached())
    }

    pub fn summary(&self) -> VolumeSummary {
        let mut summary = VolumeSummary {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            group: self.group().map(str::to_string),
            driver: self.spec.driver.clone(),
            scope: self.spec.scope,
            sharing: self.spec.sharing,
            availability: self.availability,
            published: 0,
            publish_pending: 0,
            unpublish_pending: 0,
            degraded: self.degraded.clone(),
        };
        for status in self.publish_status.values() {
            match status {
                PublishStatus::Published => summary.published += 1,
                PublishStatus::PublishPending => summary.publish_pending += 1,
                PublishStatus::UnpublishPending => summary.unpublish_pending += 1,
                PublishStatus::NotPublished => {}
            }
        }
        summary
    }
}

/// Listing view of a volume with per-status publish counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSummary {
    pub id: VolumeId,
    pub name: String,
    pub group: Option<String>,
    pub driver: String,
    pub scope: ScopeKind,
    pub sharing: SharingKind,
    pub availability: AvailabilityState,
    pub published: u32,
    pub publish_pending: u32,
    pub unpublish_pending: u32,
    pub degraded: Option<String>,
}

/// Criteria for listing volumes. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    pub name: Option<String>,
    pub group: Option<String>,
    pub driver: Option<String>,
    pub availability: Option<AvailabilityState>,
    pub label: Option<(String, String)>,
}

impl VolumeFilter {
    pub fn group(group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, volume: &Volume) -> bool {
        self.name.as_deref().is_none_or(|n| volume.name() == n)
            && self.group.as_deref().is_none_or(|g| volume.group() == Some(g))
            && self.driver.as_deref().is_none_or(|d| volume.driver() == d)
            && self.availability.is_none_or(|a| volume.availability == a)
            && self
                .label
                .as_ref()
                .is_none_or(|(k, v)| volume.spec.labels.get(k) == Some(v))
    }
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Manager,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Down,
    Unknown,
}

/// Membership and health facts for a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub role: NodeRole,
    /// Whether this manager currently leads the cluster.
    pub leader: bool,
    pub status: NodeStatus,
    /// Administrative availability; only `Active` nodes accept new work.
    pub availability: AvailabilityState,
    /// Topology segments this node belongs to, e.g. `zone=a`.
    pub topology: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Unix timestamp of last heartbeat.
    pub last_heartbeat: u64,
}

impl NodeInfo {
    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready && self.availability == AvailabilityState::Active
    }
}

// ── Drivers and plugins ───────────────────────────────────────────

/// What a storage driver supports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub scopes: Vec<ScopeKind>,
    pub sharing: Vec<SharingKind>,
    /// Whether volume operations need a controller component on the leader.
    pub requires_controller: bool,
}

/// A storage driver known to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub aliases: Vec<String>,
    pub capabilities: DriverCapabilities,
}

impl DriverInfo {
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }
}

/// Plugin interfaces present on a node for a driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInterfaces {
    pub controller: bool,
    pub node: bool,
}

/// Per-node plugin fact as reported by the plugin feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginFact {
    pub node_id: NodeId,
    /// Canonical driver name.
    pub driver: String,
    pub interfaces: PluginInterfaces,
    pub enabled: bool,
    pub healthy: bool,
    pub updated_at: u64,
}

impl PluginFact {
    pub fn serves_node(&self) -> bool {
        self.enabled && self.healthy && self.interfaces.node
    }

    pub fn serves_controller(&self) -> bool {
        self.enabled && self.healthy && self.interfaces.controller
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.node_id, self.driver)
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Shutdown,
}

/// Observed lifecycle of a task with respect to its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a placement decision.
    Pending,
    /// Node and volume chosen; publish in flight.
    Assigned,
    /// Volume published on the assigned node.
    Running,
    /// Stop requested (eviction, node loss, or shutdown).
    Stopping,
    /// Stopped; waiting for the volume to detach from the node.
    Unpublishing,
    /// Done; holds no volume.
    Complete,
}

/// A task whose placement depends on a cluster volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub service_id: ServiceId,
    pub slot: u32,
    pub requirement: VolumeRequirement,
    /// Node labels the task must match (from the general scheduler's constraints).
    pub node_labels: BTreeMap<String, String>,
    pub desired: DesiredState,
    pub state: TaskState,
    pub node_id: Option<NodeId>,
    pub volume_id: Option<VolumeId>,
    /// Why the last placement attempt failed, if it did.
    pub unschedulable: Option<String>,
    pub attempts: u32,
    /// Marked by a drain; guards against stopping the task twice.
    pub evicting: bool,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskRecord {
    pub fn new(id: &str, service_id: &str, slot: u32, requirement: VolumeRequirement, now: u64) -> Self {
        Self {
            id: id.to_string(),
            service_id: service_id.to_string(),
            slot,
            requirement,
            node_labels: BTreeMap::new(),
            desired: DesiredState::Running,
            state: TaskState::Pending,
            node_id: None,
            volume_id: None,
            unschedulable: None,
            attempts: 0,
            evicting: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the task currently holds (or is acquiring) its volume.
    pub fn holds_volume(&self) -> bool {
        self.volume_id.is_some()
            && matches!(
                self.state,
                TaskState::Assigned | TaskState::Running | TaskState::Stopping | TaskState::Unpublishing
            )
    }

    pub fn uses(&self, volume_id: &str, node_id: &str) -> bool {
        self.holds_volume()
            && self.volume_id.as_deref() == Some(volume_id)
            && self.node_id.as_deref() == Some(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(publish: &[(&str, PublishStatus)]) -> Volume {
        Volume {
            id: "vol-1".to_string(),
            spec: VolumeSpec {
                name: "v1".to_string(),
                group: Some(String::new()),
                driver: "csi.example".to_string(),
                scope: ScopeKind::SingleNode,
                sharing: SharingKind::ReadWrite,
                capacity: CapacityRange::default(),
                labels: BTreeMap::new(),
            },
            availability: AvailabilityState::Active,
            publish_status: publish.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            accessible_topology: Vec::new(),
            capacity_bytes: None,
            degraded: None,
            version: 1,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn empty_group_reads_as_none() {
        assert_eq!(volume(&[]).group(), None);
    }

    #[test]
    fn summary_counts_statuses() {
        let v = volume(&[
            ("n1", PublishStatus::Published),
            ("n2", PublishStatus::UnpublishPending),
        ]);
        let summary = v.summary();
        assert_eq!(summary.published, 1);
        assert_eq!(summary.unpublish_pending, 1);
        assert_eq!(summary.publish_pending, 0);
    }

    #[test]
    fn holders_and_detachment() {
        let v = volume(&[("n1", PublishStatus::PublishPending)]);
        assert_eq!(v.reserved_holder().map(String::as_str), Some("n1"));
        assert!(v.attached_elsewhere("n1").is_none());
        assert!(v.attached_elsewhere("n2").is_some());
        assert!(!v.is_fully_unpublished());
        assert_eq!(v.status_on("n9"), PublishStatus::NotPublished);
    }

    #[test]
    fn filter_matches_fields() {
        let mut v = volume(&[]);
        v.spec.group = Some("db".to_string());
        v.spec.labels.insert("tier".to_string(), "gold".to_string());

        assert!(VolumeFilter::group("db").matches(&v));
        assert!(!VolumeFilter::group("cache").matches(&v));
        let by_label = VolumeFilter {
            label: Some(("tier".to_string(), "gold".to_string())),
            availability: Some(AvailabilityState::Active),
            ..VolumeFilter::default()
        };
        assert!(by_label.matches(&v));
    }
}
