//! Constraint evaluator: eligibility of volumes and nodes for one task.
//!
//! For a direct reference the named volume must exist, be Active, not be
//! degraded, and admit the task's mount mode given current usage. For a
//! group selector every member is checked the same way and the survivors
//! are returned in name order. In both cases a single-node volume already
//! held on a node restricts placement to that node.

use std::collections::BTreeSet;

use tracing::debug;

use volgrid_state::*;
use volgrid_topology::TopologyResolver;

use crate::error::{ConstraintError, ConstraintResult};
use crate::placement::{Candidate, VolumePlacement};

#[derive(Clone)]
pub struct ConstraintEvaluator {
    registry: VolumeRegistry,
    topology: TopologyResolver,
}

impl ConstraintEvaluator {
    pub fn new(registry: VolumeRegistry, topology: TopologyResolver) -> Self {
        Self { registry, topology }
    }

    /// Compute the (volume, node-set) pairs that could satisfy `task`.
    ///
    /// Usage by other tasks is read from the task table; the task itself
    /// is never counted against its own requirement.
    pub fn evaluate(&self, task: &TaskRecord) -> ConstraintResult<VolumePlacement> {
        let tasks = self.registry.store().list_tasks()?;
        let placement = match &task.requirement.source {
            VolumeSource::Name(name) => self.evaluate_named(task, name, &tasks)?,
            VolumeSource::Group(group) => self.evaluate_group(task, group, &tasks)?,
        };
        debug!(
            task_id = %task.id,
            requirement = %task.requirement.source,
            candidates = placement.candidates.len(),
            "constraints evaluated"
        );
        Ok(placement)
    }

    fn evaluate_named(
        &self,
        task: &TaskRecord,
        name: &str,
        tasks: &[TaskRecord],
    ) -> ConstraintResult<VolumePlacement> {
        let volume = self.registry.get_by_name(name)?.ok_or_else(|| {
            ConstraintError::VolumeNotAvailable {
                volume: name.to_string(),
                reason: "no such volume".to_string(),
            }
        })?;

        let usage = usage_of(&volume.id, tasks, &task.id);
        check_usable(&volume, task.requirement.mode, &usage).map_err(|reason| {
            ConstraintError::VolumeNotAvailable {
                volume: name.to_string(),
                reason,
            }
        })?;

        let nodes = self.candidate_nodes(&volume)?;
        if nodes.is_empty() {
            return Err(ConstraintError::NoEligibleNode {
                requirement: name.to_string(),
            });
        }
        Ok(VolumePlacement {
            candidates: vec![candidate(&volume, nodes)],
        })
    }

    fn evaluate_group(
        &self,
        task: &TaskRecord,
        group: &str,
        tasks: &[TaskRecord],
    ) -> ConstraintResult<VolumePlacement> {
        let mut candidates = Vec::new();
        for volume in self.registry.list_group(group)? {
            let usage = usage_of(&volume.id, tasks, &task.id);
            if let Err(reason) = check_usable(&volume, task.requirement.mode, &usage) {
                debug!(%group, volume = %volume.name(), %reason, "group member skipped");
                continue;
            }
            let nodes = self.candidate_nodes(&volume)?;
            if nodes.is_empty() {
                debug!(%group, volume = %volume.name(), "group member has no eligible node");
                continue;
            }
            candidates.push(candidate(&volume, nodes));
        }

        if candidates.is_empty() {
            return Err(ConstraintError::GroupExhausted {
                group: group.to_string(),
            });
        }
        Ok(VolumePlacement { candidates })
    }

    /// Topology-eligible nodes narrowed by the single-node rule.
    fn candidate_nodes(&self, volume: &Volume) -> ConstraintResult<BTreeSet<NodeId>> {
        let mut nodes = self.topology.eligible_nodes(volume)?;
        if volume.spec.scope == ScopeKind::SingleNode {
            if let Some(holder) = volume.reserved_holder() {
                nodes.retain(|n| n == holder);
            } else if volume
                .publish_status
                .values()
                .any(|s| *s == PublishStatus::UnpublishPending)
            {
                // Still detaching somewhere; wait for it.
                nodes.clear();
            }
        }
        Ok(nodes)
    }
}

fn candidate(volume: &Volume, nodes: BTreeSet<NodeId>) -> Candidate {
    Candidate {
        volume_id: volume.id.clone(),
        volume_name: volume.spec.name.clone(),
        driver: volume.spec.driver.clone(),
        nodes,
        attached: volume
            .publish_status
            .iter()
            .filter(|(_, s)| s.is_reserved())
            .map(|(n, _)| n.clone())
            .collect(),
    }
}

fn check_usable(volume: &Volume, mode: MountMode, usage: &VolumeUsage) -> Result<(), String> {
    if !volume.availability.allows_new_placement() {
        return Err(format!("availability is {}", volume.availability));
    }
    if let Some(reason) = &volume.degraded {
        return Err(format!("degraded: {reason}"));
    }
    if !volume.spec.sharing.admits(mode, usage) {
        return Err(format!(
            "{} sharing does not admit a {} mount ({} readers, {} writers)",
            volume.spec.sharing, mode, usage.readers, usage.writers
        ));
    }
    Ok(())
}

/// Mount usage of a volume by tasks other than `exclude`.
fn usage_of(volume_id: &str, tasks: &[TaskRecord], exclude: &str) -> VolumeUsage {
    let mut usage = VolumeUsage::default();
    for t in tasks {
        if t.id != exclude && t.holds_volume() && t.volume_id.as_deref() == Some(volume_id) {
            usage.add(t.requirement.mode);
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use volgrid_topology::MembershipManager;

    struct Fixture {
        registry: VolumeRegistry,
        evaluator: ConstraintEvaluator,
    }

    fn fixture(nodes: &[&str]) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let membership = MembershipManager::new(state.clone());
        membership
            .register_driver(DriverInfo {
                name: "csi.example".to_string(),
                aliases: Vec::new(),
                capabilities: DriverCapabilities {
                    scopes: vec![ScopeKind::SingleNode, ScopeKind::MultiNode],
                    sharing: vec![
                        SharingKind::Exclusive,
                        SharingKind::ReadOnly,
                        SharingKind::OneWriter,
                        SharingKind::ReadWrite,
                    ],
                    requires_controller: false,
                },
            })
            .unwrap();
        for id in nodes {
            membership
                .join(NodeInfo {
                    id: id.to_string(),
                    address: String::new(),
                    role: NodeRole::Worker,
                    leader: false,
                    status: NodeStatus::Ready,
                    availability: AvailabilityState::Active,
                    topology: BTreeMap::new(),
                    labels: BTreeMap::new(),
                    last_heartbeat: 0,
                })
                .unwrap();
            membership
                .record_plugin_fact(
                    id,
                    "csi.example",
                    PluginInterfaces {
                        controller: true,
                        node: true,
                    },
                    true,
                    true,
                )
                .unwrap();
        }
        let registry = VolumeRegistry::new(state.clone());
        let evaluator = ConstraintEvaluator::new(registry.clone(), TopologyResolver::new(state));
        Fixture {
            registry,
            evaluator,
        }
    }

    fn create(
        f: &Fixture,
        name: &str,
        group: Option<&str>,
        scope: ScopeKind,
        sharing: SharingKind,
    ) -> Volume {
        f.registry
            .create(VolumeSpec {
                name: name.to_string(),
                group: group.map(str::to_string),
                driver: "csi.example".to_string(),
                scope,
                sharing,
                capacity: CapacityRange::default(),
                labels: BTreeMap::new(),
            })
            .unwrap()
    }

    fn task(id: &str, source: &str, mode: MountMode) -> TaskRecord {
        TaskRecord::new(id, "svc", 1, VolumeRequirement::new(source, mode).unwrap(), 0)
    }

    fn node_names(nodes: BTreeSet<NodeId>) -> Vec<String> {
        nodes.into_iter().collect()
    }

    #[test]
    fn direct_reference_uses_topology() {
        let f = fixture(&["n1", "n2"]);
        create(&f, "v1", None, ScopeKind::MultiNode, SharingKind::ReadWrite);

        let placement = f
            .evaluator
            .evaluate(&task("t1", "v1", MountMode::ReadWrite))
            .unwrap();
        assert_eq!(node_names(placement.eligible_nodes()), vec!["n1", "n2"]);
    }

    #[test]
    fn single_node_volume_pins_to_holder() {
        let f = fixture(&["n1", "n2", "n3"]);
        let v1 = create(&f, "v1", None, ScopeKind::SingleNode, SharingKind::ReadWrite);
        f.registry.reserve_publish(&v1.id, "n1").unwrap();
        f.registry
            .record_publish_transition(&v1.id, "n1", PublishStatus::Published)
            .unwrap();

        let placement = f
            .evaluator
            .evaluate(&task("t2", "v1", MountMode::ReadWrite))
            .unwrap();
        assert_eq!(node_names(placement.eligible_nodes()), vec!["n1"]);
        assert!(!placement.allows("n2"));
    }

    #[test]
    fn detaching_single_node_volume_blocks_placement() {
        let f = fixture(&["n1", "n2"]);
        let v1 = create(&f, "v1", None, ScopeKind::SingleNode, SharingKind::ReadWrite);
        f.registry.reserve_publish(&v1.id, "n1").unwrap();
        f.registry
            .record_publish_transition(&v1.id, "n1", PublishStatus::UnpublishPending)
            .unwrap();

        let err = f
            .evaluator
            .evaluate(&task("t1", "v1", MountMode::ReadWrite))
            .unwrap_err();
        assert!(matches!(err, ConstraintError::NoEligibleNode { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn paused_volume_not_available() {
        let f = fixture(&["n1"]);
        let v3 = create(&f, "v3", None, ScopeKind::MultiNode, SharingKind::ReadWrite);
        f.registry
            .update_availability(&v3.id, AvailabilityState::Pause)
            .unwrap();

        let t = task("t1", "v3", MountMode::ReadOnly);
        assert!(matches!(
            f.evaluator.evaluate(&t),
            Err(ConstraintError::VolumeNotAvailable { .. })
        ));

        f.registry
            .update_availability(&v3.id, AvailabilityState::Active)
            .unwrap();
        assert!(f.evaluator.evaluate(&t).is_ok());
    }

    #[test]
    fn missing_volume_not_available() {
        let f = fixture(&["n1"]);
        assert!(matches!(
            f.evaluator.evaluate(&task("t1", "nope", MountMode::ReadOnly)),
            Err(ConstraintError::VolumeNotAvailable { .. })
        ));
    }

    #[test]
    fn group_filters_by_sharing() {
        let f = fixture(&["n1", "n2"]);
        let v1 = create(&f, "v1", Some("db"), ScopeKind::MultiNode, SharingKind::ReadWrite);
        create(&f, "v2", Some("db"), ScopeKind::MultiNode, SharingKind::ReadOnly);

        let t = task("t1", "group:db", MountMode::ReadWrite);
        let placement = f.evaluator.evaluate(&t).unwrap();
        assert_eq!(placement.candidates.len(), 1);
        assert_eq!(placement.candidates[0].volume_name, "v1");

        // Read-only requests may use either member.
        let ro = f
            .evaluator
            .evaluate(&task("t2", "group:db", MountMode::ReadOnly))
            .unwrap();
        assert_eq!(ro.candidates.len(), 2);

        f.registry
            .update_availability(&v1.id, AvailabilityState::Pause)
            .unwrap();
        assert!(matches!(
            f.evaluator.evaluate(&t),
            Err(ConstraintError::GroupExhausted { .. })
        ));
    }

    #[test]
    fn degraded_volume_rejected_and_group_member_skipped() {
        let f = fixture(&["n1"]);
        let a1 = create(&f, "a1", Some("db"), ScopeKind::MultiNode, SharingKind::ReadWrite);
        create(&f, "b2", Some("db"), ScopeKind::MultiNode, SharingKind::ReadWrite);
        f.registry
            .mark_degraded(&a1.id, "publish on n1 failed 3 times")
            .unwrap();

        let err = f
            .evaluator
            .evaluate(&task("t1", "a1", MountMode::ReadWrite))
            .unwrap_err();
        assert!(err.to_string().contains("degraded"));

        let placement = f
            .evaluator
            .evaluate(&task("t2", "group:db", MountMode::ReadWrite))
            .unwrap();
        assert_eq!(placement.candidates.len(), 1);
        assert_eq!(placement.candidates[0].volume_name, "b2");

        f.registry.clear_degraded(&a1.id).unwrap();
        assert!(
            f.evaluator
                .evaluate(&task("t1", "a1", MountMode::ReadWrite))
                .is_ok()
        );
    }

    #[test]
    fn exclusive_volume_admits_one_task() {
        let f = fixture(&["n1"]);
        let v1 = create(&f, "v1", None, ScopeKind::MultiNode, SharingKind::Exclusive);

        let mut holder = task("t1", "v1", MountMode::ReadOnly);
        holder.state = TaskState::Running;
        holder.node_id = Some("n1".to_string());
        holder.volume_id = Some(v1.id.clone());
        f.registry.store().put_task(&holder).unwrap();

        // The holder itself still evaluates cleanly.
        assert!(f.evaluator.evaluate(&holder).is_ok());
        assert!(matches!(
            f.evaluator.evaluate(&task("t2", "v1", MountMode::ReadOnly)),
            Err(ConstraintError::VolumeNotAvailable { .. })
        ));
    }

    #[test]
    fn one_writer_allows_readers_alongside() {
        let f = fixture(&["n1"]);
        let v1 = create(&f, "v1", None, ScopeKind::MultiNode, SharingKind::OneWriter);

        let mut writer = task("t1", "v1", MountMode::ReadWrite);
        writer.state = TaskState::Running;
        writer.node_id = Some("n1".to_string());
        writer.volume_id = Some(v1.id.clone());
        f.registry.store().put_task(&writer).unwrap();

        assert!(
            f.evaluator
                .evaluate(&task("t2", "v1", MountMode::ReadOnly))
                .is_ok()
        );
        assert!(
            f.evaluator
                .evaluate(&task("t3", "v1", MountMode::ReadWrite))
                .is_err()
        );
    }
}
