//! Shared types used across volgrid crates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a volume (`vol-<hex>`).
pub type VolumeId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for the service owning a task.
pub type ServiceId = String;

/// A plugin-reported locality constraint, e.g. `{"zone": "us-east-1a"}`.
///
/// A node matches a segment when every key/value pair of the segment is
/// present in the node's own topology.
pub type TopologySegment = BTreeMap<String, String>;

/// Whether a volume may be attached to one node at a time or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    SingleNode,
    MultiNode,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::SingleNode => "single-node",
            ScopeKind::MultiNode => "multi-node",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many tasks may use a volume at once, and in which mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingKind {
    /// One task at a time, any mode.
    Exclusive,
    /// Any number of tasks, read-only mounts only.
    ReadOnly,
    /// Any number of readers, at most one writer.
    OneWriter,
    /// Any number of tasks in any mode.
    ReadWrite,
}

impl SharingKind {
    /// Whether this sharing mode can ever accept a mount in `mode`.
    pub fn permits(&self, mode: MountMode) -> bool {
        match self {
            SharingKind::ReadOnly => mode == MountMode::ReadOnly,
            SharingKind::Exclusive | SharingKind::OneWriter | SharingKind::ReadWrite => true,
        }
    }

    /// Whether one more task mounting in `mode` fits next to the current users.
    pub fn admits(&self, mode: MountMode, usage: &VolumeUsage) -> bool {
        if !self.permits(mode) {
            return false;
        }
        match self {
            SharingKind::Exclusive => usage.total() == 0,
            SharingKind::OneWriter => mode == MountMode::ReadOnly || usage.writers == 0,
            SharingKind::ReadOnly | SharingKind::ReadWrite => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SharingKind::Exclusive => "exclusive",
            SharingKind::ReadOnly => "read-only",
            SharingKind::OneWriter => "one-writer",
            SharingKind::ReadWrite => "read-write",
        }
    }
}

impl fmt::Display for SharingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mount mode requested by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::ReadOnly => f.write_str("read-only"),
            MountMode::ReadWrite => f.write_str("read-write"),
        }
    }
}

/// Count of tasks currently bound to a volume, split by mount mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeUsage {
    pub readers: u32,
    pub writers: u32,
}

impl VolumeUsage {
    pub fn total(&self) -> u32 {
        self.readers + self.writers
    }

    pub fn add(&mut self, mode: MountMode) {
        match mode {
            MountMode::ReadOnly => self.readers += 1,
            MountMode::ReadWrite => self.writers += 1,
        }
    }
}

/// Attachment state of a volume on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    NotPublished,
    PublishPending,
    Published,
    UnpublishPending,
}

impl PublishStatus {
    /// Published or on its way there. These count against single-node scope.
    pub fn is_reserved(&self) -> bool {
        matches!(self, PublishStatus::PublishPending | PublishStatus::Published)
    }

    /// Any state other than fully detached.
    pub fn is_attached(&self) -> bool {
        !matches!(self, PublishStatus::NotPublished)
    }

    /// Whether the publish lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PublishStatus) -> bool {
        use PublishStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (NotPublished, PublishPending)
                | (PublishPending, Published)
                | (PublishPending, UnpublishPending)
                | (PublishPending, NotPublished)
                | (Published, UnpublishPending)
                | (UnpublishPending, NotPublished)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::NotPublished => "not-published",
            PublishStatus::PublishPending => "publish-pending",
            PublishStatus::Published => "published",
            PublishStatus::UnpublishPending => "unpublish-pending",
        }
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true when every entry of `segment` is present in `node_topology`.
pub fn segment_matches(segment: &TopologySegment, node_topology: &BTreeMap<String, String>) -> bool {
    segment
        .iter()
        .all(|(k, v)| node_topology.get(k).is_some_and(|nv| nv == v))
}

/// Returns true when the node can reach a volume with the given accessible topology.
///
/// An empty list means the volume is reachable from anywhere.
pub fn topology_accessible(
    accessible: &[TopologySegment],
    node_topology: &BTreeMap<String, String>,
) -> bool {
    accessible.is_empty() || accessible.iter().any(|s| segment_matches(s, node_topology))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn read_only_sharing_rejects_writers() {
        assert!(SharingKind::ReadOnly.permits(MountMode::ReadOnly));
        assert!(!SharingKind::ReadOnly.permits(MountMode::ReadWrite));
        assert!(SharingKind::ReadWrite.permits(MountMode::ReadWrite));
    }

    #[test]
    fn one_writer_admits_single_writer() {
        let mut usage = VolumeUsage::default();
        assert!(SharingKind::OneWriter.admits(MountMode::ReadWrite, &usage));
        usage.add(MountMode::ReadWrite);
        assert!(!SharingKind::OneWriter.admits(MountMode::ReadWrite, &usage));
        assert!(SharingKind::OneWriter.admits(MountMode::ReadOnly, &usage));
    }

    #[test]
    fn exclusive_admits_only_first_user() {
        let mut usage = VolumeUsage::default();
        assert!(SharingKind::Exclusive.admits(MountMode::ReadOnly, &usage));
        usage.add(MountMode::ReadOnly);
        assert!(!SharingKind::Exclusive.admits(MountMode::ReadOnly, &usage));
    }

    #[test]
    fn publish_lifecycle_edges() {
        use PublishStatus::*;
        assert!(NotPublished.can_transition_to(PublishPending));
        assert!(PublishPending.can_transition_to(Published));
        assert!(Published.can_transition_to(UnpublishPending));
        assert!(UnpublishPending.can_transition_to(NotPublished));
        assert!(Published.can_transition_to(Published));

        assert!(!NotPublished.can_transition_to(Published));
        assert!(!Published.can_transition_to(NotPublished));
        assert!(!UnpublishPending.can_transition_to(Published));
    }

    #[test]
    fn reserved_statuses() {
        assert!(PublishStatus::Published.is_reserved());
        assert!(PublishStatus::PublishPending.is_reserved());
        assert!(!PublishStatus::UnpublishPending.is_reserved());
        assert!(PublishStatus::UnpublishPending.is_attached());
    }

    #[test]
    fn empty_topology_is_accessible_anywhere() {
        assert!(topology_accessible(&[], &topo(&[])));
    }

    #[test]
    fn topology_requires_matching_segment() {
        let node = topo(&[("zone", "a"), ("rack", "r1")]);
        let a = topo(&[("zone", "a")]);
        let b = topo(&[("zone", "b")]);
        assert!(topology_accessible(&[b.clone(), a], &node));
        assert!(!topology_accessible(&[b], &node));
        assert!(!topology_accessible(&[topo(&[("zone", "a"), ("rack", "r2")])], &node));
    }
}
