//! Membership manager: tracks node and plugin facts.
//!
//! Applies the node feed and the plugin feed to the state store and
//! detects dead nodes from missed heartbeats.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use volgrid_state::*;

use crate::error::{TopologyError, TopologyResult};

/// Node feed input.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A node joined or its description changed.
    Upsert(NodeInfo),
    Heartbeat {
        node_id: NodeId,
    },
    /// The node is unreachable; its tasks must move.
    Down {
        node_id: NodeId,
    },
    Left {
        node_id: NodeId,
    },
    Availability {
        node_id: NodeId,
        availability: AvailabilityState,
    },
}

/// Plugin feed input.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    /// A storage driver became known to the cluster.
    Driver(DriverInfo),
    /// Interfaces present for a driver on one node.
    Fact {
        node_id: NodeId,
        driver: String,
        interfaces: PluginInterfaces,
        enabled: bool,
        healthy: bool,
    },
    Removed {
        node_id: NodeId,
        driver: String,
    },
}

/// What a node event did to placement-relevant state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    Unchanged,
    Changed,
    /// The node went down or left; work on it must be rescheduled.
    Lost,
}

/// Manages cluster membership state.
///
/// Persists node information, drivers, and plugin facts to the
/// `StateStore` for the topology resolver to read.
#[derive(Clone)]
pub struct MembershipManager {
    state: StateStore,
    /// Dead node detection threshold.
    dead_timeout: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            dead_timeout: Duration::from_secs(30),
        }
    }

    /// Set the dead node detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register or refresh a node. The node is marked Ready as of now.
    pub fn join(&self, mut node: NodeInfo) -> TopologyResult<()> {
        node.status = NodeStatus::Ready;
        node.last_heartbeat = epoch_secs();
        if node.leader {
            self.clear_other_leaders(&node.id)?;
        }
        self.state.put_node(&node)?;
        info!(node_id = %node.id, address = %node.address, role = ?node.role, "node joined cluster");
        Ok(())
    }

    /// Record a heartbeat. A Down node that heartbeats again is Ready.
    ///
    /// Returns false for unknown nodes.
    pub fn heartbeat(&self, node_id: &str) -> TopologyResult<bool> {
        let result = self.state.update_node(node_id, |n| {
            let revived = n.status != NodeStatus::Ready;
            n.status = NodeStatus::Ready;
            n.last_heartbeat = epoch_secs();
            Ok::<_, StateError>(revived)
        });
        match result {
            Ok(updated) => {
                if updated.output {
                    info!(%node_id, "node is ready again");
                } else {
                    debug!(%node_id, "heartbeat received");
                }
                Ok(true)
            }
            Err(StateError::NotFound(_)) => {
                warn!(%node_id, "heartbeat from unknown node");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a node Down. Returns true if its status changed.
    pub fn mark_down(&self, node_id: &str) -> TopologyResult<bool> {
        let updated = self
            .state
            .update_node(node_id, |n| {
                n.status = NodeStatus::Down;
                Ok::<_, StateError>(())
            })
            .map_err(|e| unknown_node(e, node_id))?;
        if updated.changed {
            warn!(%node_id, "node marked down");
        }
        Ok(updated.changed)
    }

    /// Remove a node and every plugin fact it reported.
    pub fn leave(&self, node_id: &str) -> TopologyResult<bool> {
        let existed = self.state.delete_node(node_id)?;
        let facts = self.state.delete_plugin_facts_for_node(node_id)?;
        if existed {
            info!(%node_id, facts, "node left cluster");
        }
        Ok(existed)
    }

    pub fn set_availability(
        &self,
        node_id: &str,
        availability: AvailabilityState,
    ) -> TopologyResult<bool> {
        let updated = self
            .state
            .update_node(node_id, |n| {
                let transition = n.availability.check_transition(availability)?;
                n.availability = availability;
                Ok::<_, TopologyError>(transition)
            })
            .map_err(|e| match e {
                TopologyError::State(StateError::NotFound(_)) => {
                    TopologyError::UnknownNode(node_id.to_string())
                }
                other => other,
            })?;
        if let Transition::Changed { from, to } = updated.output {
            info!(%node_id, %from, %to, "node availability changed");
        }
        Ok(updated.changed)
    }

    /// Mark Ready nodes whose last heartbeat is older than the dead timeout as Down.
    ///
    /// Returns the IDs of nodes that went down.
    pub fn detect_dead_nodes(&self) -> TopologyResult<Vec<NodeId>> {
        let now = epoch_secs();
        let mut dead = Vec::new();
        for node in self.state.list_nodes()? {
            if node.status == NodeStatus::Ready
                && now.saturating_sub(node.last_heartbeat) > self.dead_timeout.as_secs()
                && self.mark_down(&node.id)?
            {
                dead.push(node.id);
            }
        }
        if !dead.is_empty() {
            warn!(count = dead.len(), "dead nodes detected");
        }
        Ok(dead)
    }

    pub fn list_nodes(&self) -> TopologyResult<Vec<NodeInfo>> {
        Ok(self.state.list_nodes()?)
    }

    fn clear_other_leaders(&self, leader: &str) -> TopologyResult<()> {
        for node in self.state.list_nodes()? {
            if node.leader && node.id != leader {
                self.state.update_node(&node.id, |n| {
                    n.leader = false;
                    Ok::<_, StateError>(())
                })?;
            }
        }
        Ok(())
    }

    /// Apply one node feed event.
    pub fn apply_node_event(&self, event: NodeEvent) -> TopologyResult<NodeChange> {
        match event {
            NodeEvent::Upsert(node) => {
                self.join(node)?;
                Ok(NodeChange::Changed)
            }
            NodeEvent::Heartbeat { node_id } => {
                let before = self.state.get_node(&node_id)?.map(|n| n.status);
                self.heartbeat(&node_id)?;
                Ok(match before {
                    Some(NodeStatus::Ready) | None => NodeChange::Unchanged,
                    Some(_) => NodeChange::Changed,
                })
            }
            NodeEvent::Down { node_id } => Ok(if self.mark_down(&node_id)? {
                NodeChange::Lost
            } else {
                NodeChange::Unchanged
            }),
            NodeEvent::Left { node_id } => Ok(if self.leave(&node_id)? {
                NodeChange::Lost
            } else {
                NodeChange::Unchanged
            }),
            NodeEvent::Availability {
                node_id,
                availability,
            } => Ok(if self.set_availability(&node_id, availability)? {
                NodeChange::Changed
            } else {
                NodeChange::Unchanged
            }),
        }
    }

    // ── Drivers and plugins ────────────────────────────────────────

    pub fn register_driver(&self, driver: DriverInfo) -> TopologyResult<()> {
        self.state.put_driver(&driver)?;
        info!(driver = %driver.name, aliases = ?driver.aliases, "storage driver registered");
        Ok(())
    }

    /// Record the interfaces a node runs for a driver (name or alias).
    pub fn record_plugin_fact(
        &self,
        node_id: &str,
        driver: &str,
        interfaces: PluginInterfaces,
        enabled: bool,
        healthy: bool,
    ) -> TopologyResult<()> {
        let driver = self.canonical_driver(driver)?;
        let fact = PluginFact {
            node_id: node_id.to_string(),
            driver,
            interfaces,
            enabled,
            healthy,
            updated_at: epoch_secs(),
        };
        self.state.put_plugin_fact(&fact)?;
        debug!(
            %node_id,
            driver = %fact.driver,
            controller = interfaces.controller,
            node = interfaces.node,
            enabled,
            healthy,
            "plugin fact recorded"
        );
        Ok(())
    }

    pub fn remove_plugin_fact(&self, node_id: &str, driver: &str) -> TopologyResult<bool> {
        let driver = self.canonical_driver(driver)?;
        let existed = self.state.delete_plugin_fact(node_id, &driver)?;
        if existed {
            info!(%node_id, %driver, "plugin removed from node");
        }
        Ok(existed)
    }

    /// Apply one plugin feed event.
    pub fn apply_plugin_event(&self, event: PluginEvent) -> TopologyResult<()> {
        match event {
            PluginEvent::Driver(driver) => self.register_driver(driver),
            PluginEvent::Fact {
                node_id,
                driver,
                interfaces,
                enabled,
                healthy,
            } => self.record_plugin_fact(&node_id, &driver, interfaces, enabled, healthy),
            PluginEvent::Removed { node_id, driver } => {
                self.remove_plugin_fact(&node_id, &driver).map(|_| ())
            }
        }
    }

    fn canonical_driver(&self, driver: &str) -> TopologyResult<String> {
        Ok(self
            .state
            .find_driver(driver)?
            .map(|d| d.name)
            .unwrap_or_else(|| driver.to_string()))
    }
}

fn unknown_node(err: StateError, node_id: &str) -> TopologyError {
    match err {
        StateError::NotFound(_) => TopologyError::UnknownNode(node_id.to_string()),
        other => other.into(),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn test_state() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn test_node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            address: "10.0.0.1:4242".to_string(),
            role: NodeRole::Worker,
            leader: false,
            status: NodeStatus::Unknown,
            availability: AvailabilityState::Active,
            topology: BTreeMap::new(),
            labels: BTreeMap::new(),
            last_heartbeat: 0,
        }
    }

    #[test]
    fn join_marks_ready() {
        let mgr = MembershipManager::new(test_state());
        mgr.join(test_node("n1")).unwrap();

        let node = mgr.state().get_node("n1").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert!(node.last_heartbeat > 0);
    }

    #[test]
    fn only_one_leader() {
        let mgr = MembershipManager::new(test_state());
        let mut m1 = test_node("m1");
        m1.role = NodeRole::Manager;
        m1.leader = true;
        let mut m2 = m1.clone();
        m2.id = "m2".to_string();

        mgr.join(m1).unwrap();
        mgr.join(m2).unwrap();

        let leaders: Vec<String> = mgr
            .list_nodes()
            .unwrap()
            .into_iter()
            .filter(|n| n.leader)
            .map(|n| n.id)
            .collect();
        assert_eq!(leaders, vec!["m2"]);
    }

    #[test]
    fn heartbeat_unknown_node_returns_false() {
        let mgr = MembershipManager::new(test_state());
        assert!(!mgr.heartbeat("unknown").unwrap());
    }

    #[test]
    fn heartbeat_revives_down_node() {
        let mgr = MembershipManager::new(test_state());
        mgr.join(test_node("n1")).unwrap();
        assert!(mgr.mark_down("n1").unwrap());
        assert!(!mgr.mark_down("n1").unwrap());

        assert_eq!(
            mgr.apply_node_event(NodeEvent::Heartbeat {
                node_id: "n1".to_string()
            })
            .unwrap(),
            NodeChange::Changed
        );
        let node = mgr.state().get_node("n1").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
    }

    #[test]
    fn dead_node_detection() {
        let state = test_state();
        let mgr = MembershipManager::new(state.clone()).with_dead_timeout(Duration::from_secs(0));
        mgr.join(test_node("n1")).unwrap();
        mgr.join(test_node("n2")).unwrap();

        // Age n1's heartbeat far into the past.
        let mut node = state.get_node("n1").unwrap().unwrap();
        node.last_heartbeat = 1000;
        state.put_node(&node).unwrap();

        assert_eq!(mgr.detect_dead_nodes().unwrap(), vec!["n1".to_string()]);
        // Already down, not reported twice.
        assert!(mgr.detect_dead_nodes().unwrap().is_empty());
    }

    #[test]
    fn down_and_left_are_losses() {
        let mgr = MembershipManager::new(test_state());
        mgr.join(test_node("n1")).unwrap();
        mgr.join(test_node("n2")).unwrap();
        mgr.record_plugin_fact("n2", "csi.example", PluginInterfaces { controller: false, node: true }, true, true)
            .unwrap();

        let change = mgr
            .apply_node_event(NodeEvent::Down {
                node_id: "n1".to_string(),
            })
            .unwrap();
        assert_eq!(change, NodeChange::Lost);

        let change = mgr
            .apply_node_event(NodeEvent::Left {
                node_id: "n2".to_string(),
            })
            .unwrap();
        assert_eq!(change, NodeChange::Lost);
        assert!(mgr.state().list_plugin_facts().unwrap().is_empty());
    }

    #[test]
    fn node_availability_follows_state_machine() {
        let mgr = MembershipManager::new(test_state());
        mgr.join(test_node("n1")).unwrap();

        assert!(mgr.set_availability("n1", AvailabilityState::Drain).unwrap());
        assert!(matches!(
            mgr.set_availability("n1", AvailabilityState::Pause),
            Err(TopologyError::IllegalTransition(_))
        ));
        assert!(matches!(
            mgr.set_availability("nx", AvailabilityState::Pause),
            Err(TopologyError::UnknownNode(_))
        ));
    }

    #[test]
    fn plugin_facts_use_canonical_driver() {
        let mgr = MembershipManager::new(test_state());
        mgr.apply_plugin_event(PluginEvent::Driver(DriverInfo {
            name: "csi.example".to_string(),
            aliases: vec!["example".to_string()],
            capabilities: DriverCapabilities {
                scopes: vec![ScopeKind::SingleNode],
                sharing: vec![SharingKind::Exclusive],
                requires_controller: false,
            },
        }))
        .unwrap();
        mgr.apply_plugin_event(PluginEvent::Fact {
            node_id: "n1".to_string(),
            driver: "example".to_string(),
            interfaces: PluginInterfaces {
                controller: false,
                node: true,
            },
            enabled: true,
            healthy: true,
        })
        .unwrap();

        let facts = mgr.state().list_plugin_facts_for_driver("csi.example").unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].serves_node());

        mgr.apply_plugin_event(PluginEvent::Removed {
            node_id: "n1".to_string(),
            driver: "example".to_string(),
        })
        .unwrap();
        assert!(mgr.state().list_plugin_facts().unwrap().is_empty());
    }
}
