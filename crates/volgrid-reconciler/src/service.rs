//! VolumeService: the operations exposed to operators and the orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use volgrid_placement::ConstraintEvaluator;
use volgrid_plugin::{PluginRegistry, call_with_timeout};
use volgrid_state::*;

use crate::error::{ReconcileError, ReconcileResult};

/// Facade over the registry, evaluator, and task table.
///
/// Mutations that can change placement wake the reconcile worker.
#[derive(Clone)]
pub struct VolumeService {
    registry: VolumeRegistry,
    evaluator: ConstraintEvaluator,
    plugins: Arc<PluginRegistry>,
    plugin_timeout: Duration,
    trigger: Arc<Notify>,
}

impl VolumeService {
    pub fn new(
        registry: VolumeRegistry,
        evaluator: ConstraintEvaluator,
        plugins: Arc<PluginRegistry>,
        plugin_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            evaluator,
            plugins,
            plugin_timeout,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    /// Wakes the reconcile worker.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    fn poke(&self) {
        self.trigger.notify_one();
    }

    // ── Volumes ────────────────────────────────────────────────────

    /// Register a volume, then ask its plugin for capacity and locality.
    ///
    /// A failed plugin lookup leaves the volume registered without topology.
    pub async fn create_volume(&self, spec: VolumeSpec) -> ReconcileResult<Volume> {
        let volume = self.registry.create(spec)?;
        match self.refresh_volume_info(&volume.id).await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) => {
                warn!(volume_id = %volume.id, error = %e, "volume info unavailable");
                Ok(volume)
            }
        }
    }

    /// Pull capacity and accessible topology from the volume's plugin.
    pub async fn refresh_volume_info(&self, volume_id: &str) -> ReconcileResult<Volume> {
        let volume = self.registry.get(volume_id)?;
        let plugin = self.plugins.get(volume.driver())?;
        let info = call_with_timeout(self.plugin_timeout, plugin.volume_info(&volume)).await?;
        debug!(
            %volume_id,
            capacity = ?info.capacity_bytes,
            segments = info.accessible_topology.len(),
            "volume info refreshed"
        );
        let volume = self.registry.set_accessible_topology(
            volume_id,
            info.accessible_topology,
            info.capacity_bytes,
        )?;
        Ok(volume)
    }

    /// Re-read volume info for every volume of `driver`.
    ///
    /// A volume marked degraded is recovered once its plugin answers
    /// again. Returns the recovered volume IDs.
    pub async fn refresh_driver(&self, driver: &str) -> ReconcileResult<Vec<VolumeId>> {
        let filter = VolumeFilter {
            driver: Some(driver.to_string()),
            ..VolumeFilter::default()
        };
        let mut recovered = Vec::new();
        for volume in self.registry.list(&filter)? {
            match self.refresh_volume_info(&volume.id).await {
                Ok(refreshed) if refreshed.degraded.is_some() => {
                    self.registry.clear_degraded(&volume.id)?;
                    recovered.push(volume.id);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(volume_id = %volume.id, error = %e, "volume info refresh failed");
                }
            }
        }
        if !recovered.is_empty() {
            info!(%driver, volumes = ?recovered, "degraded volumes recovered");
            self.poke();
        }
        Ok(recovered)
    }

    pub fn set_availability(
        &self,
        volume_id: &str,
        availability: AvailabilityState,
    ) -> ReconcileResult<Volume> {
        let volume = self.registry.update_availability(volume_id, availability)?;
        self.poke();
        Ok(volume)
    }

    pub fn set_group(&self, volume_id: &str, group: Option<String>) -> ReconcileResult<Volume> {
        let volume = self.registry.set_group(volume_id, group)?;
        self.poke();
        Ok(volume)
    }

    pub fn list_volumes(&self, filter: &VolumeFilter) -> ReconcileResult<Vec<VolumeSummary>> {
        Ok(self
            .registry
            .list(filter)?
            .iter()
            .map(Volume::summary)
            .collect())
    }

    pub fn delete_volume(&self, volume_id: &str) -> ReconcileResult<Volume> {
        Ok(self.registry.delete(volume_id)?)
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Eligible nodes for `task`, each with the volume it would bind there.
    pub fn placement(&self, task: &TaskRecord) -> ReconcileResult<BTreeMap<NodeId, VolumeId>> {
        let placement = self.evaluator.evaluate(task)?;
        Ok(placement
            .eligible_nodes()
            .into_iter()
            .filter_map(|node| {
                let volume_id = placement.bind(&node)?.volume_id.clone();
                Some((node, volume_id))
            })
            .collect())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn submit_task(&self, task: TaskRecord) -> ReconcileResult<()> {
        let store = self.registry.store();
        if store.get_task(&task.id)?.is_some() {
            return Err(ReconcileError::TaskExists(task.id));
        }
        store.put_task(&task)?;
        info!(
            task_id = %task.id,
            service_id = %task.service_id,
            slot = task.slot,
            requirement = %task.requirement.source,
            mode = %task.requirement.mode,
            "task submitted"
        );
        self.poke();
        Ok(())
    }

    /// Ask for a task to stop. Its volume is released by the reconciler.
    pub fn remove_task(&self, task_id: &str) -> ReconcileResult<TaskRecord> {
        let updated = self
            .registry
            .store()
            .update_task(task_id, |t| {
                t.desired = DesiredState::Shutdown;
                Ok::<_, StateError>(())
            })
            .map_err(|e| match e {
                StateError::NotFound(_) => ReconcileError::TaskNotFound(task_id.to_string()),
                other => other.into(),
            })?;
        if updated.changed {
            info!(%task_id, "task shutdown requested");
            self.poke();
        }
        Ok(updated.record)
    }

    pub fn task(&self, task_id: &str) -> ReconcileResult<TaskRecord> {
        self.registry
            .store()
            .get_task(task_id)?
            .ok_or_else(|| ReconcileError::TaskNotFound(task_id.to_string()))
    }

    pub fn list_tasks(&self) -> ReconcileResult<Vec<TaskRecord>> {
        Ok(self.registry.store().list_tasks()?)
    }
}
