//! volgridd: the volgrid daemon.
//!
//! Assembles the volume scheduler:
//! - State store (redb)
//! - Volume registry + membership
//! - Constraint evaluator + first-fit node picker
//! - Reconciler and its control loops
//!
//! # Usage
//!
//! ```text
//! volgridd run --config /etc/volgrid/volgrid.toml --data-dir /var/lib/volgrid
//! volgridd run --local-driver local.disk
//! volgridd check-config --config /etc/volgrid/volgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use vol_core::VolgridConfig;
use volgrid_placement::{ConstraintEvaluator, FirstFit};
use volgrid_plugin::PluginRegistry;
use volgrid_plugin::fake::FakePlugin;
use volgrid_reconciler::{
    FeedSenders, LoopIntervals, Reconciler, ReconcilerSettings, VolumeService, feeds,
    spawn_control_loops,
};
use volgrid_state::*;
use volgrid_topology::{MembershipManager, NodeEvent, PluginEvent, TopologyResolver};

const LOCAL_NODE: &str = "local";
const FEED_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "volgridd", about = "volgrid cluster volume scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler control loops until interrupted.
    Run {
        /// Path to volgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides `[state] data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Serve this driver from an in-memory plugin on a local node.
        #[arg(long)]
        local_driver: Option<String>,
    },
    /// Validate a config file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            local_driver,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.state.data_dir = dir;
            }
            init_tracing(&config);
            run(config, local_driver).await
        }
        Command::CheckConfig { config } => {
            let config = VolgridConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<VolgridConfig> {
    match path {
        Some(path) => VolgridConfig::from_file(path),
        None => Ok(VolgridConfig::default()),
    }
}

fn init_tracing(config: &VolgridConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log.filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: VolgridConfig, local_driver: Option<String>) -> anyhow::Result<()> {
    info!("volgrid daemon starting");

    std::fs::create_dir_all(&config.state.data_dir)?;
    let db_path = config.state.data_dir.join("volgrid.redb");

    // ── Initialize components ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let membership =
        MembershipManager::new(state.clone()).with_dead_timeout(config.membership.dead_timeout());
    let topology = TopologyResolver::new(state.clone());
    let registry = VolumeRegistry::new(state);
    let evaluator = ConstraintEvaluator::new(registry.clone(), topology.clone());

    let mut plugins = PluginRegistry::new();
    let local = local_driver.map(|name| local_driver_info(&name));
    if let Some(driver) = &local {
        membership.register_driver(driver.clone())?;
        plugins.register(driver, Arc::new(FakePlugin::new()));
        info!(driver = %driver.name, "in-memory plugin registered");
    }
    let plugins = Arc::new(plugins);

    let settings = ReconcilerSettings::from(&config.reconciler);
    let service = VolumeService::new(
        registry.clone(),
        evaluator.clone(),
        Arc::clone(&plugins),
        settings.plugin_timeout,
    );
    let reconciler = Reconciler::new(
        registry,
        evaluator,
        plugins,
        Arc::new(FirstFit),
        settings,
    );
    info!(
        tick = %config.reconciler.tick_interval,
        plugin_timeout = %config.reconciler.plugin_timeout,
        max_plugin_attempts = config.reconciler.max_plugin_attempts,
        "reconciler initialized"
    );

    // ── Start control loops ────────────────────────────────────

    let (senders, receivers) = feeds(FEED_CAPACITY);
    let dead_timeout = config.membership.dead_timeout();
    let handle = spawn_control_loops(
        reconciler,
        service,
        membership,
        topology,
        receivers,
        LoopIntervals {
            tick: config.reconciler.tick_interval(),
            dead_node_check: (dead_timeout / 2).max(Duration::from_secs(1)),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_handle = match &local {
        Some(driver) => {
            announce_local_node(&senders, driver).await?;
            let interval = (dead_timeout / 3).max(Duration::from_secs(1));
            Some(tokio::spawn(heartbeat_loop(
                senders.clone(),
                interval,
                shutdown_rx,
            )))
        }
        None => None,
    };

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = heartbeat_handle {
        let _ = handle.await;
    }
    handle.shutdown().await;
    drop(senders);

    info!("volgrid daemon stopped");
    Ok(())
}

fn local_driver_info(name: &str) -> DriverInfo {
    DriverInfo {
        name: name.to_string(),
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
    }
}

/// Join this process as a single manager node serving the local driver.
async fn announce_local_node(senders: &FeedSenders, driver: &DriverInfo) -> anyhow::Result<()> {
    let node = NodeInfo {
        id: LOCAL_NODE.to_string(),
        address: "127.0.0.1".to_string(),
        role: NodeRole::Manager,
        leader: true,
        status: NodeStatus::Ready,
        availability: AvailabilityState::Active,
        topology: Default::default(),
        labels: Default::default(),
        last_heartbeat: 0,
    };
    senders.nodes.send(NodeEvent::Upsert(node)).await?;
    senders
        .plugins
        .send(PluginEvent::Fact {
            node_id: LOCAL_NODE.to_string(),
            driver: driver.name.clone(),
            interfaces: PluginInterfaces {
                controller: true,
                node: true,
            },
            enabled: true,
            healthy: true,
        })
        .await?;
    info!(node_id = LOCAL_NODE, driver = %driver.name, "local node announced");
    Ok(())
}

async fn heartbeat_loop(
    senders: FeedSenders,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let event = NodeEvent::Heartbeat { node_id: LOCAL_NODE.to_string() };
                if senders.nodes.send(event).await.is_err() {
                    warn!("node feed closed, stopping heartbeats");
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
