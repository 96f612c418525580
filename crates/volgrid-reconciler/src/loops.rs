//! Control loops: feed consumers and the reconcile worker.
//!
//! Four loops consume their feeds independently and write through to the
//! store; each one wakes the worker when something placement-relevant
//! changed. The worker alone runs reconciliation passes, on every wake-up,
//! on plugin completions, and on a fixed tick for retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use volgrid_state::*;
use volgrid_topology::{MembershipManager, NodeChange, NodeEvent, PluginEvent, TopologyResolver};

use crate::reconciler::Reconciler;
use crate::service::VolumeService;

/// Task feed input from the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Submit(TaskRecord),
    Remove { task_id: TaskId },
}

/// Sending halves of the three external feeds.
#[derive(Clone)]
pub struct FeedSenders {
    pub nodes: mpsc::Sender<NodeEvent>,
    pub plugins: mpsc::Sender<PluginEvent>,
    pub tasks: mpsc::Sender<TaskEvent>,
}

/// Receiving halves, consumed by [`spawn_control_loops`].
pub struct Feeds {
    nodes: mpsc::Receiver<NodeEvent>,
    plugins: mpsc::Receiver<PluginEvent>,
    tasks: mpsc::Receiver<TaskEvent>,
}

/// Create bounded node, plugin, and task feeds.
pub fn feeds(capacity: usize) -> (FeedSenders, Feeds) {
    let (nodes_tx, nodes) = mpsc::channel(capacity);
    let (plugins_tx, plugins) = mpsc::channel(capacity);
    let (tasks_tx, tasks) = mpsc::channel(capacity);
    (
        FeedSenders {
            nodes: nodes_tx,
            plugins: plugins_tx,
            tasks: tasks_tx,
        },
        Feeds {
            nodes,
            plugins,
            tasks,
        },
    )
}

#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    /// Periodic reconcile pass.
    pub tick: Duration,
    /// How often to look for nodes that stopped heartbeating.
    pub dead_node_check: Duration,
}

/// Handle to the running loops.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    trigger: Arc<Notify>,
}

impl ReconcilerHandle {
    /// Request an immediate reconcile pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "control loop panicked");
            }
        }
        info!("control loops stopped");
    }
}

/// Spawn the node, volume, plugin, and task loops plus the reconcile worker.
pub fn spawn_control_loops(
    reconciler: Reconciler,
    service: VolumeService,
    membership: MembershipManager,
    topology: TopologyResolver,
    feeds: Feeds,
    intervals: LoopIntervals,
) -> ReconcilerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = service.trigger();
    let volume_events = service.registry().subscribe();

    let handles = vec![
        tokio::spawn(run_reconcile_worker(
            reconciler,
            Arc::clone(&trigger),
            intervals.tick,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_node_loop(
            membership.clone(),
            feeds.nodes,
            Arc::clone(&trigger),
            intervals.dead_node_check,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_volume_loop(
            service.clone(),
            volume_events,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_plugin_loop(
            membership,
            topology,
            service.clone(),
            feeds.plugins,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_task_loop(service, feeds.tasks, shutdown_rx)),
    ];
    info!(tick = ?intervals.tick, "control loops started");

    ReconcilerHandle {
        shutdown_tx,
        handles,
        trigger,
    }
}

enum Wake {
    Pass,
    Shutdown,
}

async fn run_reconcile_worker(
    mut reconciler: Reconciler,
    trigger: Arc<Notify>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("reconcile worker starting");

    loop {
        let inflight = reconciler.inflight() > 0;
        let wake = tokio::select! {
            _ = shutdown.changed() => Wake::Shutdown,
            _ = reconciler.wait_completion(), if inflight => Wake::Pass,
            _ = trigger.notified() => Wake::Pass,
            _ = ticker.tick() => Wake::Pass,
        };
        if let Wake::Shutdown = wake {
            break;
        }
        if let Err(e) = reconciler.reconcile_once() {
            error!(error = %e, "reconcile pass failed");
        }
    }

    // Record the results of calls already sent to plugins.
    let summary = reconciler.drain_inflight().await;
    debug!(completed = summary.completed, "reconcile worker shutting down");
}

async fn run_node_loop(
    membership: MembershipManager,
    mut events: mpsc::Receiver<NodeEvent>,
    trigger: Arc<Notify>,
    dead_node_check: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(dead_node_check);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("node feed closed");
                    break;
                };
                match membership.apply_node_event(event) {
                    Ok(NodeChange::Unchanged) => {}
                    Ok(change) => {
                        debug!(?change, "node change");
                        trigger.notify_one();
                    }
                    Err(e) => warn!(error = %e, "failed to apply node event"),
                }
            }
            _ = sweep.tick() => {
                match membership.detect_dead_nodes() {
                    Ok(dead) if !dead.is_empty() => trigger.notify_one(),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "dead node detection failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("node loop shutting down");
}

async fn run_volume_loop(
    service: VolumeService,
    mut events: tokio::sync::broadcast::Receiver<VolumeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let trigger = service.trigger();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(VolumeEvent::PublishChanged { .. }) | Ok(VolumeEvent::Recovered { .. }) => {}
                Ok(VolumeEvent::Degraded { volume_id, reason }) => {
                    warn!(%volume_id, %reason, "volume degraded");
                }
                Ok(event) => {
                    debug!(?event, "volume change");
                    trigger.notify_one();
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "volume watch lagged, forcing a pass");
                    trigger.notify_one();
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("volume loop shutting down");
}

async fn run_plugin_loop(
    membership: MembershipManager,
    topology: TopologyResolver,
    service: VolumeService,
    mut events: mpsc::Receiver<PluginEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let trigger = service.trigger();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        let Some(event) = event else {
            debug!("plugin feed closed");
            break;
        };

        let driver = match &event {
            PluginEvent::Driver(info) => info.name.clone(),
            PluginEvent::Fact { driver, .. } | PluginEvent::Removed { driver, .. } => driver.clone(),
        };
        if let Err(e) = membership.apply_plugin_event(event) {
            warn!(%driver, error = %e, "failed to apply plugin event");
            continue;
        }
        if let Err(e) = refresh_driver(&membership, &topology, &service, &driver).await {
            warn!(%driver, error = %e, "driver refresh failed");
        }
        trigger.notify_one();
    }
    debug!("plugin loop shutting down");
}

/// Report missing controllers, then refresh the driver's volumes.
async fn refresh_driver(
    membership: &MembershipManager,
    topology: &TopologyResolver,
    service: &VolumeService,
    driver: &str,
) -> crate::error::ReconcileResult<()> {
    let Some(info) = membership.state().find_driver(driver)? else {
        return Ok(());
    };
    if info.capabilities.requires_controller {
        let missing = topology.missing_controllers(&info.name)?;
        if !missing.is_empty() {
            warn!(driver = %info.name, managers = ?missing, "managers without a controller plugin");
        }
    }
    service.refresh_driver(&info.name).await?;
    Ok(())
}

async fn run_task_loop(
    service: VolumeService,
    mut events: mpsc::Receiver<TaskEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        let result = match event {
            Some(TaskEvent::Submit(task)) => service.submit_task(task),
            Some(TaskEvent::Remove { task_id }) => service.remove_task(&task_id).map(|_| ()),
            None => {
                debug!("task feed closed");
                break;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to apply task event");
        }
    }
    debug!("task loop shutting down");
}
