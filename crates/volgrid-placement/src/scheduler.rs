//! The general scheduler seam.

use volgrid_state::{NodeId, NodeInfo, TaskRecord};

/// Chooses a node for a task among nodes that satisfy the volume predicate.
///
/// `nodes` is every known node, ordered by id.
pub trait ResourceScheduler: Send + Sync {
    fn pick_node(
        &self,
        task: &TaskRecord,
        nodes: &[NodeInfo],
        allows: &dyn Fn(&str) -> bool,
    ) -> Option<NodeId>;
}

/// Lowest node id that is schedulable, passes the predicate, and carries
/// every label the task asks for.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFit;

impl ResourceScheduler for FirstFit {
    fn pick_node(
        &self,
        task: &TaskRecord,
        nodes: &[NodeInfo],
        allows: &dyn Fn(&str) -> bool,
    ) -> Option<NodeId> {
        nodes
            .iter()
            .filter(|n| n.is_schedulable() && allows(&n.id))
            .filter(|n| {
                task.node_labels
                    .iter()
                    .all(|(k, v)| n.labels.get(k) == Some(v))
            })
            .map(|n| n.id.clone())
            .min()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use volgrid_state::{
        AvailabilityState, MountMode, NodeRole, NodeStatus, VolumeRequirement,
    };

    fn node(id: &str, labels: &[(&str, &str)]) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            address: String::new(),
            role: NodeRole::Worker,
            leader: false,
            status: NodeStatus::Ready,
            availability: AvailabilityState::Active,
            topology: BTreeMap::new(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            last_heartbeat: 0,
        }
    }

    fn task() -> TaskRecord {
        TaskRecord::new(
            "t1",
            "svc",
            1,
            VolumeRequirement::new("v1", MountMode::ReadWrite).unwrap(),
            0,
        )
    }

    #[test]
    fn picks_lowest_allowed_node() {
        let nodes = vec![node("n3", &[]), node("n1", &[]), node("n2", &[])];
        let picked = FirstFit.pick_node(&task(), &nodes, &|n| n != "n1");
        assert_eq!(picked.as_deref(), Some("n2"));
    }

    #[test]
    fn honors_node_labels() {
        let nodes = vec![node("n1", &[]), node("n2", &[("disk", "ssd")])];
        let mut t = task();
        t.node_labels.insert("disk".to_string(), "ssd".to_string());
        assert_eq!(FirstFit.pick_node(&t, &nodes, &|_| true).as_deref(), Some("n2"));
        assert_eq!(FirstFit.pick_node(&t, &nodes, &|n| n == "n1"), None);
    }
}
