//! Topology resolver: computes the nodes from which a volume is reachable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::debug;

use volgrid_state::*;

use crate::error::TopologyResult;

/// Why a node cannot reach a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    NodeNotReady(NodeStatus),
    NodeUnavailable(AvailabilityState),
    /// No node interface for the driver on this node.
    NoNodePlugin,
    /// The node interface exists but is disabled or unhealthy.
    PluginUnhealthy,
    /// None of the volume's accessible segments match the node.
    OutsideTopology,
    /// The driver needs a controller and none is reachable.
    NoController,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::NodeNotReady(status) => write!(f, "node is {status:?}"),
            Exclusion::NodeUnavailable(availability) => write!(f, "node availability is {availability}"),
            Exclusion::NoNodePlugin => f.write_str("no node plugin for driver"),
            Exclusion::PluginUnhealthy => f.write_str("node plugin disabled or unhealthy"),
            Exclusion::OutsideTopology => f.write_str("outside volume accessible topology"),
            Exclusion::NoController => f.write_str("no reachable controller for driver"),
        }
    }
}

/// Answers "which nodes can attach this volume right now".
///
/// Stateless over the store: every call reads current node and plugin
/// facts, so answers reflect the feeds as of the last committed update.
#[derive(Clone)]
pub struct TopologyResolver {
    state: StateStore,
}

impl TopologyResolver {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Nodes that can attach `volume`, ordered by node id.
    pub fn eligible_nodes(&self, volume: &Volume) -> TopologyResult<BTreeSet<NodeId>> {
        let nodes: BTreeSet<NodeId> = self
            .classify(volume)?
            .into_iter()
            .filter_map(|(node, exclusion)| exclusion.is_none().then_some(node))
            .collect();
        debug!(volume_id = %volume.id, eligible = nodes.len(), "topology resolved");
        Ok(nodes)
    }

    /// Every excluded node with the first reason it was excluded.
    pub fn explain(&self, volume: &Volume) -> TopologyResult<BTreeMap<NodeId, Exclusion>> {
        Ok(self
            .classify(volume)?
            .into_iter()
            .filter_map(|(node, exclusion)| exclusion.map(|e| (node, e)))
            .collect())
    }

    /// Ready managers without a usable controller interface for `driver`.
    pub fn missing_controllers(&self, driver: &str) -> TopologyResult<Vec<NodeId>> {
        let facts = self.facts_by_node(driver)?;
        Ok(self
            .state
            .list_nodes()?
            .into_iter()
            .filter(|n| n.role == NodeRole::Manager && n.status == NodeStatus::Ready)
            .filter(|n| !facts.get(&n.id).is_some_and(|f| f.serves_controller()))
            .map(|n| n.id)
            .collect())
    }

    /// Whether the driver's controller side can be reached.
    ///
    /// The recorded leader decides when there is one; otherwise any Ready
    /// manager with the controller interface will do.
    pub fn controller_reachable(&self, driver: &str) -> TopologyResult<bool> {
        let nodes = self.state.list_nodes()?;
        let facts = self.facts_by_node(driver)?;
        Ok(controller_reachable(&nodes, &facts))
    }

    fn facts_by_node(&self, driver: &str) -> TopologyResult<HashMap<NodeId, PluginFact>> {
        Ok(self
            .state
            .list_plugin_facts_for_driver(driver)?
            .into_iter()
            .map(|f| (f.node_id.clone(), f))
            .collect())
    }

    fn classify(&self, volume: &Volume) -> TopologyResult<BTreeMap<NodeId, Option<Exclusion>>> {
        let driver = volume.driver();
        let requires_controller = self
            .state
            .find_driver(driver)?
            .is_some_and(|d| d.capabilities.requires_controller);
        let nodes = self.state.list_nodes()?;
        let facts = self.facts_by_node(driver)?;
        let no_controller = requires_controller && !controller_reachable(&nodes, &facts);

        Ok(nodes
            .iter()
            .map(|node| {
                let exclusion = if no_controller {
                    Some(Exclusion::NoController)
                } else {
                    node_exclusion(node, facts.get(&node.id), &volume.accessible_topology)
                };
                (node.id.clone(), exclusion)
            })
            .collect())
    }
}

fn node_exclusion(
    node: &NodeInfo,
    fact: Option<&PluginFact>,
    accessible: &[TopologySegment],
) -> Option<Exclusion> {
    if node.status != NodeStatus::Ready {
        return Some(Exclusion::NodeNotReady(node.status));
    }
    if !node.availability.allows_new_placement() {
        return Some(Exclusion::NodeUnavailable(node.availability));
    }
    match fact {
        None => return Some(Exclusion::NoNodePlugin),
        Some(f) if !f.interfaces.node => return Some(Exclusion::NoNodePlugin),
        Some(f) if !f.serves_node() => return Some(Exclusion::PluginUnhealthy),
        Some(_) => {}
    }
    if !topology_accessible(accessible, &node.topology) {
        return Some(Exclusion::OutsideTopology);
    }
    None
}

fn controller_reachable(nodes: &[NodeInfo], facts: &HashMap<NodeId, PluginFact>) -> bool {
    let serves = |n: &NodeInfo| facts.get(&n.id).is_some_and(|f| f.serves_controller());
    let managers = nodes
        .iter()
        .filter(|n| n.role == NodeRole::Manager && n.status == NodeStatus::Ready);
    match nodes.iter().find(|n| n.role == NodeRole::Manager && n.leader) {
        Some(leader) => leader.status == NodeStatus::Ready && serves(leader),
        None => managers.into_iter().any(serves),
    }
}
