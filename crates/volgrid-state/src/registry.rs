//! Volume registry: the single source of truth for volumes.
//!
//! Wraps the [`StateStore`] with validation and a watch stream. Each
//! mutation runs as one serialized read-modify-write, so an availability
//! change and a publish reservation on the same volume are strictly
//! ordered: whichever commits first wins and the other observes its result.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use vol_core::GROUP_PREFIX;

use crate::error::{RegistryError, RegistryResult, StateError};
use crate::store::{StateStore, epoch_secs};
use crate::types::*;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeEvent {
    Created {
        volume_id: VolumeId,
    },
    AvailabilityChanged {
        volume_id: VolumeId,
        from: AvailabilityState,
        to: AvailabilityState,
    },
    PublishChanged {
        volume_id: VolumeId,
        node_id: NodeId,
        status: PublishStatus,
    },
    GroupChanged {
        volume_id: VolumeId,
        group: Option<String>,
    },
    TopologyChanged {
        volume_id: VolumeId,
    },
    Degraded {
        volume_id: VolumeId,
        reason: String,
    },
    Recovered {
        volume_id: VolumeId,
    },
    Deleted {
        volume_id: VolumeId,
        name: String,
    },
}

/// Authoritative store of volumes and their per-node publish status.
#[derive(Clone)]
pub struct VolumeRegistry {
    store: StateStore,
    events: broadcast::Sender<VolumeEvent>,
}

impl VolumeRegistry {
    pub fn new(store: StateStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, events }
    }

    /// The underlying store, for collaborators that keep their own records.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Subscribe to volume change events.
    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: VolumeEvent) {
        // No receivers is fine; the control loops may not be running yet.
        let _ = self.events.send(event);
    }

    // ── Create / read ──────────────────────────────────────────────

    /// Validate a spec against its driver and register the volume as `Active`.
    pub fn create(&self, mut spec: VolumeSpec) -> RegistryResult<Volume> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidSpec("volume name is empty".to_string()));
        }
        if name.starts_with(GROUP_PREFIX) {
            return Err(RegistryError::InvalidSpec(format!(
                "volume name {name:?} may not start with {GROUP_PREFIX:?}"
            )));
        }
        spec.name = name.to_string();

        if let (Some(required), Some(limit)) =
            (spec.capacity.required_bytes, spec.capacity.limit_bytes)
            && required > limit
        {
            return Err(RegistryError::InvalidSpec(format!(
                "required capacity {required} exceeds limit {limit}"
            )));
        }

        let driver = self.store.find_driver(&spec.driver)?.ok_or_else(|| {
            RegistryError::InvalidSpec(format!("unknown volume driver {:?}", spec.driver))
        })?;
        if !driver.capabilities.scopes.contains(&spec.scope) {
            return Err(RegistryError::InvalidSpec(format!(
                "driver {} does not support {} scope",
                driver.name, spec.scope
            )));
        }
        if !driver.capabilities.sharing.contains(&spec.sharing) {
            return Err(RegistryError::InvalidSpec(format!(
                "driver {} does not support {} sharing",
                driver.name, spec.sharing
            )));
        }
        spec.driver = driver.name.clone();
        if spec.group.as_deref().is_some_and(|g| g.trim().is_empty()) {
            spec.group = None;
        }

        let now = epoch_secs();
        let volume = Volume {
            id: generate_volume_id(&spec.name),
            spec,
            availability: AvailabilityState::Active,
            publish_status: BTreeMap::new(),
            accessible_topology: Vec::new(),
            capacity_bytes: None,
            degraded: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_volume(&volume).map_err(|e| match e {
            StateError::Conflict(what) => {
                RegistryError::InvalidSpec(format!("{what} already exists"))
            }
            other => other.into(),
        })?;

        info!(
            volume_id = %volume.id,
            name = %volume.name(),
            driver = %volume.driver(),
            scope = %volume.spec.scope,
            sharing = %volume.spec.sharing,
            "volume created"
        );
        self.emit(VolumeEvent::Created {
            volume_id: volume.id.clone(),
        });
        Ok(volume)
    }

    pub fn get(&self, volume_id: &str) -> RegistryResult<Volume> {
        self.store
            .get_volume(volume_id)?
            .ok_or_else(|| RegistryError::NotFound(volume_id.to_string()))
    }

    pub fn get_by_name(&self, name: &str) -> RegistryResult<Option<Volume>> {
        Ok(self.store.get_volume_by_name(name)?)
    }

    /// List volumes matching `filter`, ordered by name.
    pub fn list(&self, filter: &VolumeFilter) -> RegistryResult<Vec<Volume>> {
        let mut volumes: Vec<Volume> = self
            .store
            .list_volumes()?
            .into_iter()
            .filter(|v| filter.matches(v))
            .collect();
        volumes.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(volumes)
    }

    /// Current members of a group, ordered by name.
    pub fn list_group(&self, group: &str) -> RegistryResult<Vec<Volume>> {
        if group.is_empty() {
            return Ok(Vec::new());
        }
        self.list(&VolumeFilter::group(group))
    }

    // ── Availability ───────────────────────────────────────────────

    /// Move a volume to a new availability state.
    ///
    /// Repeating the current state is accepted and publishes nothing.
    pub fn update_availability(
        &self,
        volume_id: &str,
        next: AvailabilityState,
    ) -> RegistryResult<Volume> {
        let updated = self.store.update_volume(volume_id, |v| {
            let transition = v.availability.check_transition(next)?;
            v.availability = next;
            Ok::<_, RegistryError>(transition)
        })?;

        if let Transition::Changed { from, to } = updated.output {
            info!(%volume_id, %from, %to, "volume availability changed");
            self.emit(VolumeEvent::AvailabilityChanged {
                volume_id: volume_id.to_string(),
                from,
                to,
            });
        } else {
            debug!(%volume_id, availability = %next, "availability unchanged");
        }
        Ok(updated.record)
    }

    // ── Publish status ─────────────────────────────────────────────

    /// Record a publish-status change for one node.
    ///
    /// Rejects `PublishPending`/`Published` on a single-node volume while
    /// another node still has it attached.
    pub fn record_publish_transition(
        &self,
        volume_id: &str,
        node_id: &str,
        status: PublishStatus,
    ) -> RegistryResult<Volume> {
        self.apply_publish(volume_id, node_id, status, false)
    }

    /// Reserve a volume on a node for a new placement.
    ///
    /// Same as recording `PublishPending`, but the volume must also be
    /// `Active` at commit time. A volume already pending or published on
    /// the node is left as is.
    pub fn reserve_publish(&self, volume_id: &str, node_id: &str) -> RegistryResult<Volume> {
        self.apply_publish(volume_id, node_id, PublishStatus::PublishPending, true)
    }

    fn apply_publish(
        &self,
        volume_id: &str,
        node_id: &str,
        status: PublishStatus,
        require_active: bool,
    ) -> RegistryResult<Volume> {
        let updated = self.store.update_volume(volume_id, |v| {
            if require_active && !v.availability.allows_new_placement() {
                return Err(RegistryError::VolumeNotAvailable {
                    volume: v.id.clone(),
                    availability: v.availability,
                });
            }

            let current = v.status_on(node_id);
            if require_active && current.is_reserved() {
                // Already held here; a co-located task shares the reservation.
                return Ok(current);
            }
            if !current.can_transition_to(status) {
                return Err(RegistryError::IllegalPublishTransition {
                    volume: v.id.clone(),
                    node: node_id.to_string(),
                    from: current,
                    to: status,
                });
            }

            if status.is_reserved()
                && v.spec.scope == ScopeKind::SingleNode
                && let Some((holder, held)) = v.attached_elsewhere(node_id)
            {
                return Err(RegistryError::ScopeConflict {
                    volume: v.id.clone(),
                    node: node_id.to_string(),
                    holder: holder.clone(),
                    status: held,
                });
            }

            if status == PublishStatus::NotPublished {
                v.publish_status.remove(node_id);
            } else {
                v.publish_status.insert(node_id.to_string(), status);
            }
            Ok(current)
        });

        let updated = match updated {
            Ok(updated) => updated,
            Err(err @ RegistryError::ScopeConflict { .. }) => {
                warn!(%volume_id, node = %node_id, error = %err, "publish rejected");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if updated.changed {
            debug!(
                %volume_id,
                node = %node_id,
                from = %updated.output,
                to = %status,
                "publish status changed"
            );
            self.emit(VolumeEvent::PublishChanged {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
                status,
            });
        }
        Ok(updated.record)
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Delete a drained, fully unpublished volume.
    pub fn delete(&self, volume_id: &str) -> RegistryResult<Volume> {
        let volume = self.store.delete_volume_checked(volume_id, |v| {
            if v.availability != AvailabilityState::Drain {
                return Err(RegistryError::VolumeInUse {
                    volume: v.id.clone(),
                    reason: format!("availability is {}, must be drain", v.availability),
                });
            }
            if let Some((node, status)) = v.publish_status.iter().find(|(_, s)| s.is_attached()) {
                return Err(RegistryError::VolumeInUse {
                    volume: v.id.clone(),
                    reason: format!("still {status} on node {node}"),
                });
            }
            Ok(())
        })?;

        info!(%volume_id, name = %volume.name(), "volume deleted");
        self.emit(VolumeEvent::Deleted {
            volume_id: volume.id.clone(),
            name: volume.spec.name.clone(),
        });
        Ok(volume)
    }

    // ── Metadata ───────────────────────────────────────────────────

    /// Change group membership. Already-bound tasks are not migrated.
    pub fn set_group(&self, volume_id: &str, group: Option<String>) -> RegistryResult<Volume> {
        let group = group.filter(|g| !g.trim().is_empty());
        let updated = self.store.update_volume(volume_id, |v| {
            v.spec.group = group.clone();
            Ok::<_, RegistryError>(())
        })?;
        if updated.changed {
            info!(%volume_id, group = ?group, "volume group changed");
            self.emit(VolumeEvent::GroupChanged {
                volume_id: volume_id.to_string(),
                group,
            });
        }
        Ok(updated.record)
    }

    pub fn set_labels(
        &self,
        volume_id: &str,
        labels: BTreeMap<String, String>,
    ) -> RegistryResult<Volume> {
        let updated = self.store.update_volume(volume_id, |v| {
            v.spec.labels = labels;
            Ok::<_, RegistryError>(())
        })?;
        Ok(updated.record)
    }

    /// Record plugin-reported locality and capacity.
    pub fn set_accessible_topology(
        &self,
        volume_id: &str,
        segments: Vec<TopologySegment>,
        capacity_bytes: Option<u64>,
    ) -> RegistryResult<Volume> {
        let updated = self.store.update_volume(volume_id, |v| {
            v.accessible_topology = segments;
            if capacity_bytes.is_some() {
                v.capacity_bytes = capacity_bytes;
            }
            Ok::<_, RegistryError>(())
        })?;
        if updated.changed {
            debug!(%volume_id, segments = updated.record.accessible_topology.len(), "volume topology updated");
            self.emit(VolumeEvent::TopologyChanged {
                volume_id: volume_id.to_string(),
            });
        }
        Ok(updated.record)
    }

    pub fn mark_degraded(&self, volume_id: &str, reason: &str) -> RegistryResult<Volume> {
        let updated = self.store.update_volume(volume_id, |v| {
            v.degraded = Some(reason.to_string());
            Ok::<_, RegistryError>(())
        })?;
        if updated.changed {
            warn!(%volume_id, %reason, "volume degraded");
            self.emit(VolumeEvent::Degraded {
                volume_id: volume_id.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(updated.record)
    }

    pub fn clear_degraded(&self, volume_id: &str) -> RegistryResult<Volume> {
        let updated = self.store.update_volume(volume_id, |v| {
            v.degraded = None;
            Ok::<_, RegistryError>(())
        })?;
        if updated.changed {
            info!(%volume_id, "volume recovered");
            self.emit(VolumeEvent::Recovered {
                volume_id: volume_id.to_string(),
            });
        }
        Ok(updated.record)
    }
}

static VOLUME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a volume ID from the name, the clock, and a process-local counter.
fn generate_volume_id(name: &str) -> VolumeId {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    VOLUME_SEQ.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    format!("vol-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VolumeRegistry {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_driver(&DriverInfo {
                name: "csi.example".to_string(),
                aliases: vec!["example".to_string()],
                capabilities: DriverCapabilities {
                    scopes: vec![ScopeKind::SingleNode, ScopeKind::MultiNode],
                    sharing: vec![
                        SharingKind::Exclusive,
                        SharingKind::ReadOnly,
                        SharingKind::ReadWrite,
                    ],
                    requires_controller: false,
                },
            })
            .unwrap();
        VolumeRegistry::new(store)
    }

    fn spec(name: &str, scope: ScopeKind) -> VolumeSpec {
        VolumeSpec {
            name: name.to_string(),
            group: None,
            driver: "example".to_string(),
            scope,
            sharing: SharingKind::ReadWrite,
            capacity: CapacityRange::default(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn create_assigns_id_and_active() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();

        assert!(vol.id.starts_with("vol-"));
        assert_eq!(vol.availability, AvailabilityState::Active);
        // Alias resolved to the canonical driver name.
        assert_eq!(vol.driver(), "csi.example");
        assert_eq!(reg.get(&vol.id).unwrap(), vol);
    }

    #[test]
    fn create_rejects_unsupported_capabilities() {
        let reg = registry();

        let mut s = spec("v", ScopeKind::SingleNode);
        s.sharing = SharingKind::OneWriter;
        assert!(matches!(reg.create(s), Err(RegistryError::InvalidSpec(_))));

        let mut s = spec("v", ScopeKind::SingleNode);
        s.driver = "missing".to_string();
        assert!(matches!(reg.create(s), Err(RegistryError::InvalidSpec(_))));

        let mut s = spec("v", ScopeKind::SingleNode);
        s.capacity = CapacityRange {
            required_bytes: Some(10),
            limit_bytes: Some(5),
        };
        assert!(matches!(reg.create(s), Err(RegistryError::InvalidSpec(_))));

        assert!(matches!(
            reg.create(spec("group:db", ScopeKind::SingleNode)),
            Err(RegistryError::InvalidSpec(_))
        ));
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let reg = registry();
        reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        assert!(matches!(
            reg.create(spec("pgdata", ScopeKind::MultiNode)),
            Err(RegistryError::InvalidSpec(_))
        ));
    }

    #[test]
    fn single_node_scope_conflict() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();

        reg.reserve_publish(&vol.id, "n1").unwrap();
        let err = reg.reserve_publish(&vol.id, "n2").unwrap_err();
        assert!(matches!(err, RegistryError::ScopeConflict { ref holder, .. } if holder == "n1"));

        reg.record_publish_transition(&vol.id, "n1", PublishStatus::Published)
            .unwrap();
        assert!(matches!(
            reg.record_publish_transition(&vol.id, "n2", PublishStatus::PublishPending),
            Err(RegistryError::ScopeConflict { .. })
        ));

        // Detaching from n1 frees the volume for n2.
        reg.record_publish_transition(&vol.id, "n1", PublishStatus::UnpublishPending)
            .unwrap();
        assert!(matches!(
            reg.reserve_publish(&vol.id, "n2"),
            Err(RegistryError::ScopeConflict { .. })
        ));
        let vol = reg
            .record_publish_transition(&vol.id, "n1", PublishStatus::NotPublished)
            .unwrap();
        assert!(vol.publish_status.is_empty());
        reg.reserve_publish(&vol.id, "n2").unwrap();
    }

    #[test]
    fn reserve_on_holder_is_noop() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        reg.reserve_publish(&vol.id, "n1").unwrap();
        reg.record_publish_transition(&vol.id, "n1", PublishStatus::Published)
            .unwrap();

        let again = reg.reserve_publish(&vol.id, "n1").unwrap();
        assert_eq!(again.status_on("n1"), PublishStatus::Published);
    }

    #[test]
    fn multi_node_allows_many_publications() {
        let reg = registry();
        let vol = reg.create(spec("shared", ScopeKind::MultiNode)).unwrap();
        reg.reserve_publish(&vol.id, "n1").unwrap();
        let vol = reg.reserve_publish(&vol.id, "n2").unwrap();
        assert_eq!(vol.summary().publish_pending, 2);
    }

    #[test]
    fn illegal_publish_edge_rejected() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        assert!(matches!(
            reg.record_publish_transition(&vol.id, "n1", PublishStatus::Published),
            Err(RegistryError::IllegalPublishTransition { .. })
        ));
    }

    #[test]
    fn reserve_requires_active() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        reg.update_availability(&vol.id, AvailabilityState::Pause)
            .unwrap();

        assert!(matches!(
            reg.reserve_publish(&vol.id, "n1"),
            Err(RegistryError::VolumeNotAvailable { .. })
        ));
    }

    #[test]
    fn availability_transitions_validated() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();

        reg.update_availability(&vol.id, AvailabilityState::Drain)
            .unwrap();
        assert!(matches!(
            reg.update_availability(&vol.id, AvailabilityState::Pause),
            Err(RegistryError::IllegalTransition(_))
        ));
        let vol = reg
            .update_availability(&vol.id, AvailabilityState::Active)
            .unwrap();
        assert_eq!(vol.availability, AvailabilityState::Active);
    }

    #[test]
    fn pause_leaves_publications_alone() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        reg.reserve_publish(&vol.id, "n1").unwrap();
        reg.record_publish_transition(&vol.id, "n1", PublishStatus::Published)
            .unwrap();

        let vol = reg
            .update_availability(&vol.id, AvailabilityState::Pause)
            .unwrap();
        assert_eq!(vol.status_on("n1"), PublishStatus::Published);
    }

    #[tokio::test]
    async fn repeated_drain_emits_one_event() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        let mut events = reg.subscribe();

        reg.update_availability(&vol.id, AvailabilityState::Drain)
            .unwrap();
        reg.update_availability(&vol.id, AvailabilityState::Drain)
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            VolumeEvent::AvailabilityChanged { to: AvailabilityState::Drain, .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn delete_requires_drain_and_unpublished() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();

        assert!(matches!(
            reg.delete(&vol.id),
            Err(RegistryError::VolumeInUse { .. })
        ));

        reg.reserve_publish(&vol.id, "n1").unwrap();
        reg.update_availability(&vol.id, AvailabilityState::Drain)
            .unwrap();
        assert!(matches!(
            reg.delete(&vol.id),
            Err(RegistryError::VolumeInUse { .. })
        ));

        reg.record_publish_transition(&vol.id, "n1", PublishStatus::UnpublishPending)
            .unwrap();
        reg.record_publish_transition(&vol.id, "n1", PublishStatus::NotPublished)
            .unwrap();
        reg.delete(&vol.id).unwrap();
        assert!(matches!(reg.get(&vol.id), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn group_membership_is_dynamic() {
        let reg = registry();
        let mut s = spec("b", ScopeKind::SingleNode);
        s.group = Some("db".to_string());
        reg.create(s).unwrap();
        let a = reg.create(spec("a", ScopeKind::SingleNode)).unwrap();

        assert_eq!(reg.list_group("db").unwrap().len(), 1);
        reg.set_group(&a.id, Some("db".to_string())).unwrap();

        let names: Vec<String> = reg
            .list_group("db")
            .unwrap()
            .into_iter()
            .map(|v| v.spec.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        reg.set_group(&a.id, Some("  ".to_string())).unwrap();
        assert_eq!(reg.list_group("db").unwrap().len(), 1);
        assert!(reg.list_group("").unwrap().is_empty());
    }

    #[test]
    fn degraded_marking() {
        let reg = registry();
        let vol = reg.create(spec("pgdata", ScopeKind::SingleNode)).unwrap();
        let vol = reg.mark_degraded(&vol.id, "publish timed out").unwrap();
        assert_eq!(vol.degraded.as_deref(), Some("publish timed out"));
        let vol = reg.clear_degraded(&vol.id).unwrap();
        assert!(vol.degraded.is_none());
    }
}
