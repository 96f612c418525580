//! Reconciler: drives publish status toward the desired task placement.
//!
//! One pass:
//!
//! 1. apply finished plugin calls (`PublishPending → Published`,
//!    `UnpublishPending → NotPublished`, or record a failure)
//! 2. stop tasks that must move (drained volume, lost node, shutdown)
//! 3. release stopped tasks whose volume is detached from their node
//! 4. sweep publications: publish what active tasks need, unpublish the rest
//! 5. place pending tasks (evaluate → pick node → bind → reserve)
//! 6. promote assigned tasks whose volume is published
//!
//! Plugin calls never block a pass. They run as spawned tasks bounded by
//! the plugin timeout and their results are picked up by a later pass.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vol_core::config::ReconcilerConfig;
use volgrid_placement::{ConstraintEvaluator, ResourceScheduler};
use volgrid_plugin::{PluginError, PluginRegistry, call_with_timeout};
use volgrid_state::*;

use crate::backoff::RetryTracker;
use crate::error::ReconcileResult;

/// Upper bound on passes [`Reconciler::settle`] runs before giving up.
const MAX_SETTLE_PASSES: usize = 64;

/// Tunables for retries and plugin calls.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub plugin_timeout: Duration,
    /// Consecutive plugin failures before a volume is marked degraded.
    pub max_plugin_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&ReconcilerConfig::default())
    }
}

impl From<&ReconcilerConfig> for ReconcilerSettings {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            plugin_timeout: config.plugin_timeout(),
            max_plugin_attempts: config.max_plugin_attempts,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginOp {
    Publish,
    Unpublish,
}

impl fmt::Display for PluginOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginOp::Publish => f.write_str("publish"),
            PluginOp::Unpublish => f.write_str("unpublish"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OpKey {
    op: PluginOp,
    volume_id: VolumeId,
    node_id: NodeId,
}

struct OpOutcome {
    key: OpKey,
    result: Result<(), PluginError>,
}

/// What one or more passes did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Plugin calls whose result was applied.
    pub completed: u32,
    pub placed: u32,
    pub unschedulable: u32,
    pub stopped: u32,
    pub released: u32,
    pub ops_started: u32,
}

impl PassSummary {
    /// Nothing moved: no placement, stop, release, or plugin activity.
    pub fn is_quiet(&self) -> bool {
        self.completed == 0
            && self.placed == 0
            && self.stopped == 0
            && self.released == 0
            && self.ops_started == 0
    }

    fn merge(&mut self, other: PassSummary) {
        self.completed += other.completed;
        self.placed += other.placed;
        self.unschedulable += other.unschedulable;
        self.stopped += other.stopped;
        self.released += other.released;
        self.ops_started += other.ops_started;
    }
}

enum PlaceError {
    /// Rejected before the task was claimed.
    Unschedulable(String),
    /// Claimed, then lost the reservation; the task is already back to Pending.
    Reverted(String),
}

/// Owns in-flight plugin calls and retry state. Driven by a single worker.
pub struct Reconciler {
    registry: VolumeRegistry,
    evaluator: ConstraintEvaluator,
    plugins: Arc<PluginRegistry>,
    scheduler: Arc<dyn ResourceScheduler>,
    settings: ReconcilerSettings,
    placement_retries: HashMap<TaskId, RetryTracker>,
    op_retries: HashMap<OpKey, RetryTracker>,
    inflight: HashMap<OpKey, tokio::task::Id>,
    ops: JoinSet<OpOutcome>,
}

impl Reconciler {
    pub fn new(
        registry: VolumeRegistry,
        evaluator: ConstraintEvaluator,
        plugins: Arc<PluginRegistry>,
        scheduler: Arc<dyn ResourceScheduler>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            registry,
            evaluator,
            plugins,
            scheduler,
            settings,
            placement_retries: HashMap::new(),
            op_retries: HashMap::new(),
            inflight: HashMap::new(),
            ops: JoinSet::new(),
        }
    }

    fn store(&self) -> &StateStore {
        self.registry.store()
    }

    /// Number of plugin calls currently running.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Plugin operations backing off after a failure.
    pub fn retrying(&self) -> usize {
        self.op_retries.len()
    }

    /// Run one reconciliation pass. Must be called within a tokio runtime.
    pub fn reconcile_once(&mut self) -> ReconcileResult<PassSummary> {
        let mut summary = PassSummary::default();
        while let Some(joined) = self.ops.try_join_next_with_id() {
            self.handle_joined(joined, &mut summary);
        }

        let now = Instant::now();
        let nodes = self.store().list_nodes()?;
        self.stop_tasks(&nodes, &mut summary)?;
        self.release_tasks(&mut summary)?;
        self.sweep_volumes(now, &mut summary)?;
        self.place_tasks(now, &nodes, &mut summary)?;
        self.promote_tasks()?;

        if !summary.is_quiet() {
            debug!(
                completed = summary.completed,
                placed = summary.placed,
                unschedulable = summary.unschedulable,
                stopped = summary.stopped,
                released = summary.released,
                ops_started = summary.ops_started,
                "reconcile pass"
            );
        }
        Ok(summary)
    }

    /// Run passes, awaiting plugin calls in between, until nothing moves.
    pub async fn settle(&mut self) -> ReconcileResult<PassSummary> {
        let mut total = PassSummary::default();
        for _ in 0..MAX_SETTLE_PASSES {
            let pass = self.reconcile_once()?;
            total.merge(pass);
            if self.ops.is_empty() {
                if pass.is_quiet() {
                    return Ok(total);
                }
                continue;
            }
            while let Some(joined) = self.ops.join_next_with_id().await {
                self.handle_joined(joined, &mut total);
            }
        }
        warn!(passes = MAX_SETTLE_PASSES, "reconciler did not settle");
        Ok(total)
    }

    /// Await every running plugin call and apply its result.
    pub async fn drain_inflight(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        while let Some(joined) = self.ops.join_next_with_id().await {
            self.handle_joined(joined, &mut summary);
        }
        summary
    }

    /// Wait for the next plugin call to finish and apply its result.
    ///
    /// Returns immediately when nothing is in flight. Cancel safe.
    pub async fn wait_completion(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        if let Some(joined) = self.ops.join_next_with_id().await {
            self.handle_joined(joined, &mut summary);
        }
        summary
    }

    // ── Plugin completions ─────────────────────────────────────────

    fn handle_joined(
        &mut self,
        joined: Result<(tokio::task::Id, OpOutcome), JoinError>,
        summary: &mut PassSummary,
    ) {
        match joined {
            Ok((_, outcome)) => {
                summary.completed += 1;
                self.apply_outcome(outcome);
            }
            Err(err) => {
                let id = err.id();
                let key = self
                    .inflight
                    .iter()
                    .find(|(_, task)| **task == id)
                    .map(|(k, _)| k.clone());
                error!(error = %err, "plugin call task failed");
                if let Some(key) = key {
                    self.inflight.remove(&key);
                    let failure = PluginError::Rpc(format!("plugin call aborted: {err}"));
                    self.op_failed(&key, &failure, Instant::now());
                }
            }
        }
    }

    fn apply_outcome(&mut self, outcome: OpOutcome) {
        let OpOutcome { key, result } = outcome;
        self.inflight.remove(&key);

        if let Err(err) = result {
            self.op_failed(&key, &err, Instant::now());
            return;
        }

        let status = match key.op {
            PluginOp::Publish => PublishStatus::Published,
            PluginOp::Unpublish => PublishStatus::NotPublished,
        };
        match self
            .registry
            .record_publish_transition(&key.volume_id, &key.node_id, status)
        {
            Ok(volume) => {
                info!(
                    volume_id = %key.volume_id,
                    node = %key.node_id,
                    op = %key.op,
                    "plugin call succeeded"
                );
                let recovered = self.op_retries.remove(&key).is_some();
                if recovered
                    && volume.degraded.is_some()
                    && let Err(e) = self.registry.clear_degraded(&key.volume_id)
                {
                    warn!(volume_id = %key.volume_id, error = %e, "failed to clear degraded flag");
                }
            }
            Err(e) => {
                warn!(
                    volume_id = %key.volume_id,
                    node = %key.node_id,
                    op = %key.op,
                    error = %e,
                    "could not record plugin result"
                );
            }
        }
    }

    fn op_failed(&mut self, key: &OpKey, err: &PluginError, now: Instant) {
        let settings = &self.settings;
        let tracker = self.op_retries.entry(key.clone()).or_insert_with(|| {
            RetryTracker::new(
                settings.backoff_base,
                settings.backoff_max,
                settings.max_plugin_attempts,
            )
        });
        tracker.record_failure(now);
        let exhausted = tracker.exhausted();
        let failures = tracker.consecutive_failures();
        warn!(
            volume_id = %key.volume_id,
            node = %key.node_id,
            op = %key.op,
            failures,
            retry_in = ?tracker.next_backoff(),
            error = %err,
            "plugin call failed"
        );

        if exhausted {
            let reason = format!("{} on {} failed {failures} times: {err}", key.op, key.node_id);
            if let Err(e) = self.registry.mark_degraded(&key.volume_id, &reason) {
                warn!(volume_id = %key.volume_id, error = %e, "failed to mark volume degraded");
            }
            if key.op == PluginOp::Publish {
                self.abandon_publish(key, &reason);
            }
        }
    }

    /// Send tasks waiting on a publish that keeps failing back to Pending.
    ///
    /// The orphaned reservation is unpublished by the next sweep and the
    /// tasks are placed again, on another group member if one is usable.
    fn abandon_publish(&mut self, key: &OpKey, reason: &str) {
        let tasks = match self.store().list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(volume_id = %key.volume_id, error = %e, "cannot list tasks to abandon publish");
                return;
            }
        };
        for task in tasks {
            if task.state != TaskState::Assigned || !task.uses(&key.volume_id, &key.node_id) {
                continue;
            }
            let reverted = self.store().update_task(&task.id, |t| {
                if t.state != TaskState::Assigned {
                    return Ok::<_, StateError>(false);
                }
                t.state = TaskState::Pending;
                t.node_id = None;
                t.volume_id = None;
                t.unschedulable = Some(reason.to_string());
                Ok(true)
            });
            match reverted {
                Ok(u) if u.output => warn!(
                    task_id = %task.id,
                    volume_id = %key.volume_id,
                    node = %key.node_id,
                    "publish abandoned, task back to pending"
                ),
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to revert task"),
            }
        }
    }

    fn ensure_op(&mut self, op: PluginOp, volume: &Volume, node_id: &str, now: Instant) -> bool {
        let key = OpKey {
            op,
            volume_id: volume.id.clone(),
            node_id: node_id.to_string(),
        };
        if self.inflight.contains_key(&key) {
            return false;
        }
        if self.op_retries.get(&key).is_some_and(|t| !t.ready(now)) {
            return false;
        }
        let plugin = match self.plugins.get(volume.driver()) {
            Ok(plugin) => plugin,
            Err(err) => {
                self.op_failed(&key, &err, now);
                return false;
            }
        };

        let timeout = self.settings.plugin_timeout;
        let volume = volume.clone();
        let node = node_id.to_string();
        let spawned_key = key.clone();
        let handle = self.ops.spawn(async move {
            let result = match op {
                PluginOp::Publish => call_with_timeout(timeout, plugin.publish(&volume, &node)).await,
                PluginOp::Unpublish => {
                    call_with_timeout(timeout, plugin.unpublish(&volume, &node)).await
                }
            };
            OpOutcome {
                key: spawned_key,
                result,
            }
        });
        debug!(volume_id = %key.volume_id, node = %key.node_id, %op, "plugin call started");
        self.inflight.insert(key, handle.id());
        true
    }

    fn is_inflight(&self, op: PluginOp, volume_id: &str, node_id: &str) -> bool {
        self.inflight.keys().any(|k| {
            k.op == op && k.volume_id == volume_id && k.node_id == node_id
        })
    }

    // ── Stopping and releasing tasks ───────────────────────────────

    fn stop_tasks(&mut self, nodes: &[NodeInfo], summary: &mut PassSummary) -> ReconcileResult<()> {
        let ready: HashSet<&str> = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Ready)
            .map(|n| n.id.as_str())
            .collect();
        let draining: HashSet<VolumeId> = self
            .store()
            .list_volumes()?
            .into_iter()
            .filter(|v| v.availability == AvailabilityState::Drain)
            .map(|v| v.id)
            .collect();

        for task in self.store().list_tasks()? {
            if !matches!(task.state, TaskState::Assigned | TaskState::Running) {
                continue;
            }
            let evict = task
                .volume_id
                .as_ref()
                .is_some_and(|v| draining.contains(v));
            let reason = if task.desired == DesiredState::Shutdown {
                "shutdown requested"
            } else if !task.node_id.as_deref().is_some_and(|n| ready.contains(n)) {
                "node lost"
            } else if evict && !task.evicting {
                "volume draining"
            } else {
                continue;
            };

            let updated = self.store().update_task(&task.id, |t| {
                if !matches!(t.state, TaskState::Assigned | TaskState::Running) {
                    return Ok::<_, StateError>(false);
                }
                if evict {
                    t.evicting = true;
                }
                t.state = TaskState::Stopping;
                Ok(true)
            });
            match updated {
                Ok(u) if u.output => {
                    summary.stopped += 1;
                    info!(
                        task_id = %task.id,
                        node = ?task.node_id,
                        volume_id = ?task.volume_id,
                        %reason,
                        "stopping task"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to stop task"),
            }
        }
        Ok(())
    }

    fn release_tasks(&mut self, summary: &mut PassSummary) -> ReconcileResult<()> {
        let tasks = self.store().list_tasks()?;
        for task in &tasks {
            let state = match task.state {
                TaskState::Stopping => {
                    // The workload is stopped; the volume can be detached.
                    self.store().update_task(&task.id, |t| {
                        if t.state == TaskState::Stopping {
                            t.state = TaskState::Unpublishing;
                        }
                        Ok::<_, StateError>(())
                    })?;
                    TaskState::Unpublishing
                }
                state => state,
            };
            if state != TaskState::Unpublishing {
                continue;
            }

            let detached = match (&task.volume_id, &task.node_id) {
                (Some(volume_id), Some(node_id)) => match self.store().get_volume(volume_id)? {
                    Some(volume) => {
                        volume.status_on(node_id) == PublishStatus::NotPublished
                            || tasks.iter().any(|t| t.id != task.id && is_active_user(t, volume_id, node_id))
                    }
                    None => true,
                },
                _ => true,
            };
            if detached && self.release(&task.id)? {
                summary.released += 1;
            }
        }
        Ok(())
    }

    /// Return a stopped task to Pending (or Complete when shut down).
    fn release(&mut self, task_id: &str) -> ReconcileResult<bool> {
        let updated = self.store().update_task(task_id, |t| {
            if t.state != TaskState::Unpublishing {
                return Ok::<_, StateError>(None);
            }
            t.node_id = None;
            t.volume_id = None;
            t.evicting = false;
            t.state = match t.desired {
                DesiredState::Running => TaskState::Pending,
                DesiredState::Shutdown => TaskState::Complete,
            };
            Ok(Some(t.state))
        })?;
        if let Some(state) = updated.output {
            info!(%task_id, ?state, "task released its volume");
            if state == TaskState::Complete {
                self.forget_task(task_id)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop a finished task from the store and from retry bookkeeping.
    fn forget_task(&mut self, task_id: &str) -> ReconcileResult<()> {
        self.store().delete_task(task_id)?;
        self.placement_retries.remove(task_id);
        debug!(%task_id, "completed task removed");
        Ok(())
    }

    // ── Publication sweep ──────────────────────────────────────────

    fn sweep_volumes(&mut self, now: Instant, summary: &mut PassSummary) -> ReconcileResult<()> {
        let tasks = self.store().list_tasks()?;
        let volumes = self.store().list_volumes()?;
        self.prune_retries(&volumes);
        for volume in volumes {
            for (node_id, status) in &volume.publish_status {
                let active = tasks.iter().any(|t| is_active_user(t, &volume.id, node_id));
                let started = match status {
                    PublishStatus::PublishPending if active => {
                        self.ensure_op(PluginOp::Publish, &volume, node_id, now)
                    }
                    PublishStatus::PublishPending => {
                        // Cancelled placement: let the publish finish, then detach.
                        !self.is_inflight(PluginOp::Publish, &volume.id, node_id)
                            && self.begin_unpublish(&volume, node_id, now)
                    }
                    PublishStatus::Published if !active => {
                        self.begin_unpublish(&volume, node_id, now)
                    }
                    PublishStatus::UnpublishPending => {
                        self.ensure_op(PluginOp::Unpublish, &volume, node_id, now)
                    }
                    PublishStatus::Published | PublishStatus::NotPublished => false,
                };
                if started {
                    summary.ops_started += 1;
                }
            }
        }
        Ok(())
    }

    /// Forget retry state for operations whose pending status is gone.
    fn prune_retries(&mut self, volumes: &[Volume]) {
        let by_id: HashMap<&str, &Volume> = volumes.iter().map(|v| (v.id.as_str(), v)).collect();
        self.op_retries.retain(|key, _| {
            let pending = match key.op {
                PluginOp::Publish => PublishStatus::PublishPending,
                PluginOp::Unpublish => PublishStatus::UnpublishPending,
            };
            by_id
                .get(key.volume_id.as_str())
                .is_some_and(|v| v.status_on(&key.node_id) == pending)
        });
    }

    fn begin_unpublish(&mut self, volume: &Volume, node_id: &str, now: Instant) -> bool {
        match self.registry.record_publish_transition(
            &volume.id,
            node_id,
            PublishStatus::UnpublishPending,
        ) {
            Ok(updated) => self.ensure_op(PluginOp::Unpublish, &updated, node_id, now),
            Err(e) => {
                warn!(volume_id = %volume.id, node = %node_id, error = %e, "cannot begin unpublish");
                false
            }
        }
    }

    // ── Placement ──────────────────────────────────────────────────

    fn place_tasks(
        &mut self,
        now: Instant,
        nodes: &[NodeInfo],
        summary: &mut PassSummary,
    ) -> ReconcileResult<()> {
        for task in self.store().list_tasks()? {
            if task.state != TaskState::Pending {
                continue;
            }
            if task.desired == DesiredState::Shutdown {
                let completed = self.store().update_task(&task.id, |t| {
                    if t.state != TaskState::Pending {
                        return Ok::<_, StateError>(false);
                    }
                    t.state = TaskState::Complete;
                    Ok(true)
                })?;
                if completed.output {
                    self.forget_task(&task.id)?;
                }
                continue;
            }
            if self
                .placement_retries
                .get(&task.id)
                .is_some_and(|t| !t.ready(now))
            {
                continue;
            }

            match self.place(&task, nodes, now) {
                Ok(true) => {
                    summary.placed += 1;
                    self.placement_retries.remove(&task.id);
                }
                Ok(false) => {}
                Err(err) => {
                    summary.unschedulable += 1;
                    self.placement_failed(&task.id, err, now)?;
                }
            }
        }
        Ok(())
    }

    fn placement_failed(&mut self, task_id: &str, err: PlaceError, now: Instant) -> ReconcileResult<()> {
        let settings = &self.settings;
        let tracker = self
            .placement_retries
            .entry(task_id.to_string())
            .or_insert_with(|| RetryTracker::new(settings.backoff_base, settings.backoff_max, u32::MAX));
        tracker.record_failure(now);
        let retry_in = tracker.next_backoff();

        let reason = match err {
            PlaceError::Unschedulable(reason) => {
                self.store().update_task(task_id, |t| {
                    if t.state == TaskState::Pending {
                        t.unschedulable = Some(reason.clone());
                        t.attempts += 1;
                    }
                    Ok::<_, StateError>(())
                })?;
                reason
            }
            PlaceError::Reverted(reason) => reason,
        };
        debug!(%task_id, %reason, ?retry_in, "task unschedulable");
        Ok(())
    }

    /// Place one task. Returns false when the task changed underneath us.
    fn place(&mut self, task: &TaskRecord, nodes: &[NodeInfo], now: Instant) -> Result<bool, PlaceError> {
        let mut placement = self.evaluator.evaluate(task).map_err(|e| {
            if !e.is_retryable() {
                error!(task_id = %task.id, error = %e, "constraint evaluation failed");
            }
            PlaceError::Unschedulable(e.to_string())
        })?;

        let plugins = Arc::clone(&self.plugins);
        placement.candidates.retain(|c| plugins.contains(&c.driver));
        if placement.candidates.is_empty() {
            return Err(PlaceError::Unschedulable(
                "no storage plugin registered for the volume driver".to_string(),
            ));
        }

        let allows = |node: &str| placement.allows(node);
        let node_id = self.scheduler.pick_node(task, nodes, &allows).ok_or_else(|| {
            PlaceError::Unschedulable("no node satisfies volume and resource constraints".to_string())
        })?;
        let candidate = placement.bind(&node_id).cloned().ok_or_else(|| {
            PlaceError::Unschedulable(format!("scheduler chose {node_id}, which no candidate volume allows"))
        })?;

        // Claim the task before reserving so the sweep sees an active user.
        let claimed = self
            .store()
            .update_task(&task.id, |t| {
                if t.state != TaskState::Pending || t.desired != DesiredState::Running {
                    return Ok::<_, StateError>(false);
                }
                t.state = TaskState::Assigned;
                t.node_id = Some(node_id.clone());
                t.volume_id = Some(candidate.volume_id.clone());
                t.unschedulable = None;
                t.attempts += 1;
                Ok(true)
            })
            .map_err(|e| PlaceError::Unschedulable(e.to_string()))?;
        if !claimed.output {
            return Ok(false);
        }

        match self.registry.reserve_publish(&candidate.volume_id, &node_id) {
            Ok(volume) => {
                info!(
                    task_id = %task.id,
                    volume_id = %volume.id,
                    volume = %volume.name(),
                    node = %node_id,
                    "task placed"
                );
                if volume.status_on(&node_id) == PublishStatus::PublishPending {
                    self.ensure_op(PluginOp::Publish, &volume, &node_id, now);
                }
                Ok(true)
            }
            Err(err) => {
                let reason = err.to_string();
                debug!(task_id = %task.id, node = %node_id, %reason, "reservation lost");
                self.store()
                    .update_task(&task.id, |t| {
                        if t.state == TaskState::Assigned {
                            t.state = TaskState::Pending;
                            t.node_id = None;
                            t.volume_id = None;
                            t.unschedulable = Some(reason.clone());
                        }
                        Ok::<_, StateError>(())
                    })
                    .map_err(|e| PlaceError::Unschedulable(e.to_string()))?;
                Err(PlaceError::Reverted(reason))
            }
        }
    }

    /// Assigned tasks whose volume is now published on their node start running.
    fn promote_tasks(&mut self) -> ReconcileResult<()> {
        for task in self.store().list_tasks()? {
            if task.state != TaskState::Assigned {
                continue;
            }
            let (Some(volume_id), Some(node_id)) = (&task.volume_id, &task.node_id) else {
                continue;
            };
            let status = self
                .store()
                .get_volume(volume_id)?
                .map(|v| v.status_on(node_id))
                .unwrap_or(PublishStatus::NotPublished);

            let next = match status {
                PublishStatus::Published => TaskState::Running,
                // Reservation vanished; start over.
                PublishStatus::NotPublished => TaskState::Pending,
                PublishStatus::PublishPending | PublishStatus::UnpublishPending => continue,
            };
            self.store().update_task(&task.id, |t| {
                if t.state != TaskState::Assigned {
                    return Ok::<_, StateError>(());
                }
                t.state = next;
                if next == TaskState::Pending {
                    t.node_id = None;
                    t.volume_id = None;
                }
                Ok(())
            })?;
            match next {
                TaskState::Running => info!(task_id = %task.id, node = %node_id, "task running"),
                _ => warn!(task_id = %task.id, node = %node_id, "reservation missing, task back to pending"),
            }
        }
        Ok(())
    }
}

/// A task that needs `volume_id` attached on `node_id` right now.
fn is_active_user(task: &TaskRecord, volume_id: &str, node_id: &str) -> bool {
    task.uses(volume_id, node_id) && matches!(task.state, TaskState::Assigned | TaskState::Running)
}
