//! Placement result: candidate volumes with their eligible nodes.

use std::collections::BTreeSet;

use volgrid_state::{NodeId, VolumeId};

/// One concrete volume that could satisfy a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub volume_id: VolumeId,
    pub volume_name: String,
    /// Canonical driver name.
    pub driver: String,
    /// Nodes from which this volume may be used by the task.
    pub nodes: BTreeSet<NodeId>,
    /// Nodes the volume is already attached to (published or pending).
    pub attached: BTreeSet<NodeId>,
}

/// Every (volume, node-set) pair that satisfies a task, in volume-name order.
///
/// Nothing is reserved; binding is decided when the node is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumePlacement {
    pub candidates: Vec<Candidate>,
}

impl VolumePlacement {
    /// Union of all candidate node sets.
    pub fn eligible_nodes(&self) -> BTreeSet<NodeId> {
        self.candidates
            .iter()
            .flat_map(|c| c.nodes.iter().cloned())
            .collect()
    }

    /// Whether the task may run on `node_id`.
    pub fn allows(&self, node_id: &str) -> bool {
        self.candidates.iter().any(|c| c.nodes.contains(node_id))
    }

    /// Choose the concrete volume for the final node.
    ///
    /// Prefers a volume already attached on that node, then name order.
    pub fn bind(&self, node_id: &str) -> Option<&Candidate> {
        self.candidates
            .iter()
            .find(|c| c.nodes.contains(node_id) && c.attached.contains(node_id))
            .or_else(|| self.candidates.iter().find(|c| c.nodes.contains(node_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, nodes: &[&str], attached: &[&str]) -> Candidate {
        Candidate {
            volume_id: format!("vol-{name}"),
            volume_name: name.to_string(),
            driver: "csi.example".to_string(),
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            attached: attached.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn union_and_predicate() {
        let placement = VolumePlacement {
            candidates: vec![candidate("a", &["n1"], &[]), candidate("b", &["n2", "n3"], &[])],
        };
        let nodes: Vec<String> = placement.eligible_nodes().into_iter().collect();
        assert_eq!(nodes, vec!["n1", "n2", "n3"]);
        assert!(placement.allows("n2"));
        assert!(!placement.allows("n4"));
    }

    #[test]
    fn bind_prefers_attached_volume() {
        let placement = VolumePlacement {
            candidates: vec![
                candidate("a", &["n1", "n2"], &[]),
                candidate("b", &["n1", "n2"], &["n2"]),
            ],
        };
        assert_eq!(placement.bind("n1").unwrap().volume_name, "a");
        assert_eq!(placement.bind("n2").unwrap().volume_name, "b");
        assert!(placement.bind("n3").is_none());
    }
}
