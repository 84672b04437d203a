//! Mesh hub binary.
//!
//! Opens the serial coordinator, keeps the mesh graph on disk, serves one TCP
//! listener per mesh node and tunnels accepted clients through virtual
//! circuits. Optionally runs a discovery or a firmware upload on startup.

use anyhow::{bail, Context};
use clap::Parser;
use hub_circuit::{CircuitManager, CircuitServer};
use hub_procedures::{
    upload_firmware, AssociateHandler, DiscoveryMode, DiscoveryProcedure, MeshFlashTarget,
    DEFAULT_IMAGE_ADDRESS,
};
use hub_session::{open_serial, probe_coordinator, PushEvent, SessionManager};
use hub_storage::{GraphStore, JsonFileStore};
use hub_topology::{fmt_node_id, parse_node_id, Network, NetworkHandle};
use hub_wire::MeshNodeId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::HubConfig;
use logging::HubLogFormatter;

/// Gateway between a serial mesh coordinator and local TCP clients
#[derive(Parser, Debug)]
#[command(name = "meshhub", version, about = "Mesh network hub")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Coordinator device, e.g. /dev/ttyUSB0
    #[arg(long)]
    serial_port: Option<String>,

    /// Coordinator baud rate
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Graph snapshot file
    #[arg(long)]
    graph: Option<PathBuf>,

    /// Listener address: `dynamic` or a fixed IP
    #[arg(long)]
    bind_address: Option<String>,

    /// Reply deadline, e.g. 500ms
    #[arg(long)]
    reply_timeout: Option<humantime::Duration>,

    /// Circuit handshake deadline, e.g. 3s
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    /// Statistics report interval, e.g. 60s
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,

    /// Run a discovery on startup: fresh or refresh
    #[arg(long, conflicts_with = "firmware")]
    discover: Option<DiscoveryMode>,

    /// Upload this firmware image on startup
    #[arg(long, requires = "target")]
    firmware: Option<PathBuf>,

    /// Node receiving the firmware image, e.g. 0x1A2B3C
    #[arg(long, value_parser = parse_node_id)]
    target: Option<MeshNodeId>,

    /// Flash address of the staged image
    #[arg(long, default_value_t = DEFAULT_IMAGE_ADDRESS)]
    flash_address: u32,

    /// Wait after rebooting the target
    #[arg(long, default_value = "5s")]
    reboot_wait: humantime::Duration,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply_to(&self, config: &mut HubConfig) {
        if let Some(port) = &self.serial_port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud_rate {
            config.serial.baud_rate = baud;
        }
        if let Some(graph) = &self.graph {
            config.graph_path = graph.clone();
        }
        if let Some(address) = &self.bind_address {
            config.circuits.bind_address = address.clone();
        }
        if let Some(timeout) = &self.reply_timeout {
            config.session.reply_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(timeout) = &self.handshake_timeout {
            config.circuits.handshake_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(interval) = &self.stats_interval {
            config.stats_interval_secs = interval.as_secs().max(1);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "meshhub",
        "hub_wire",
        "hub_topology",
        "hub_storage",
        "hub_routing",
        "hub_session",
        "hub_circuit",
        "hub_procedures",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(HubLogFormatter::new("meshhub"))
        .init();

    info!("Starting meshhub v{}", env!("CARGO_PKG_VERSION"));

    let mut config = HubConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    run(args, config).await
}

async fn run(args: Args, config: HubConfig) -> anyhow::Result<()> {
    let stream = open_serial(&config.serial_config())
        .await
        .with_context(|| format!("failed to open {}", config.serial.port))?;
    let (session, push_rx) = SessionManager::start(stream, config.session_config());

    let coordinator = probe_coordinator(&session)
        .await
        .context("coordinator did not answer the probe")?;
    component_info!(
        "serial",
        "Coordinator {} firmware {}",
        fmt_node_id(coordinator.node_id),
        coordinator.firmware
    );

    let store = JsonFileStore::new().with_backup(true);
    let graph = load_graph(&store, &config.graph_path, coordinator.node_id).await?;
    let network = NetworkHandle::new(graph);
    session.attach_network(network.clone()).await;
    spawn_graph_saver(&network, store, config.graph_path.clone());

    let manager = CircuitManager::new(session.clone(), network.clone(), config.circuit_config());
    manager.clear_connections()?;

    let server = Arc::new(CircuitServer::new(manager.clone()));
    server.refresh(&network.copy().await).await;
    let watch_id = server.clone().watch(&network);
    component_info!(
        "circuit",
        "Listening for {} nodes",
        server.listening().await.len()
    );

    let dispatcher = spawn_push_dispatcher(
        push_rx,
        manager.clone(),
        AssociateHandler::new(session.clone(), network.clone()),
    );

    let job = start_job(&args, &config, &session, &network).await;
    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));
    let outcome = supervise(&session, &manager, job, stats_interval).await;

    network.unsubscribe(watch_id);
    server.stop_all().await;
    dispatcher.abort();
    outcome
}

async fn load_graph(
    store: &JsonFileStore,
    path: &Path,
    coordinator: MeshNodeId,
) -> anyhow::Result<Network> {
    let graph = store
        .load_or_new(path, coordinator)
        .await
        .with_context(|| format!("failed to load graph {}", path.display()))?;

    if graph.local_node_id() != coordinator {
        warn!(
            "Graph {} belongs to {}, starting a new one for {}",
            path.display(),
            fmt_node_id(graph.local_node_id()),
            fmt_node_id(coordinator)
        );
        return Ok(Network::new(coordinator));
    }

    info!(
        "Graph has {} nodes, {} in use",
        graph.node_count(),
        graph.in_use_nodes().len()
    );
    Ok(graph)
}

/// Save the graph after every change, coalescing bursts
fn spawn_graph_saver(network: &NetworkHandle, store: JsonFileStore, path: PathBuf) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Network>();
    tokio::spawn(async move {
        while let Some(mut latest) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                latest = newer;
            }
            if let Err(e) = store.save_graph(&latest, &path).await {
                component_error!("storage", "Failed to save graph: {}", e);
            }
        }
    });

    network.subscribe(Arc::new(move |net: &Network| {
        let _ = tx.send(net.clone());
    }));
}

fn spawn_push_dispatcher(
    mut push_rx: mpsc::UnboundedReceiver<PushEvent>,
    manager: CircuitManager,
    associate: AssociateHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = push_rx.recv().await {
            match event {
                PushEvent::ConnectedPath(reply) => manager.handle_incoming_reply(reply).await,
                PushEvent::Associate(report) => {
                    let associate = associate.clone();
                    tokio::spawn(async move {
                        let source = report.source;
                        if let Err(e) = associate.handle(report).await {
                            component_warn!(
                                "associate",
                                "Association of {} failed: {}",
                                fmt_node_id(source),
                                e
                            );
                        }
                    });
                }
                // Already logged by the session
                PushEvent::Log(_) => {}
            }
        }
        component_debug!("session", "Push channel closed");
    })
}

async fn start_job(
    args: &Args,
    config: &HubConfig,
    session: &SessionManager,
    network: &NetworkHandle,
) -> Option<JoinHandle<anyhow::Result<()>>> {
    if let Some(mode) = args.discover {
        let mut discovery = DiscoveryProcedure::new(
            session.clone(),
            network.clone(),
            mode,
            config.discovery_config(),
        )
        .await;
        return Some(tokio::spawn(async move {
            let visited = discovery.run().await?;
            discovery.save().await?;
            component_info!("discovery", "Discovery done, {} nodes visited", visited);
            Ok(())
        }));
    }

    if let (Some(path), Some(node)) = (args.firmware.clone(), args.target) {
        let target = MeshFlashTarget::new(session.clone(), node);
        let address = args.flash_address;
        let reboot_wait = *args.reboot_wait;
        return Some(tokio::spawn(async move {
            let image = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            component_info!(
                "firmware",
                "Uploading {} ({} bytes) to {}",
                path.display(),
                image.len(),
                target
            );
            let revisions = upload_firmware(&target, image.into(), address, reboot_wait).await?;
            component_info!(
                "firmware",
                "{} updated: {} -> {}",
                target,
                revisions.before,
                revisions.after
            );
            Ok(())
        }));
    }

    None
}

async fn supervise(
    session: &SessionManager,
    manager: &CircuitManager,
    mut job: Option<JoinHandle<anyhow::Result<()>>>,
    stats_interval: Duration,
) -> anyhow::Result<()> {
    let mut link_check = tokio::time::interval(Duration::from_secs(1));
    let mut stats_tick = tokio::time::interval(stats_interval);
    stats_tick.tick().await;

    loop {
        tokio::select! {
            _ = link_check.tick() => {
                if !session.is_connected() {
                    error!("Serial link lost");
                    bail!("serial link to the coordinator was lost");
                }
            }
            _ = stats_tick.tick() => {
                let link = session.stats();
                component_info!(
                    "session",
                    "frames out={} in={} timeouts={} decode_errors={}",
                    link.frames_out,
                    link.frames_in,
                    link.timeouts,
                    link.decode_errors
                );
                manager.stats().log_summary();
            }
            result = wait_job(&mut job) => {
                job = None;
                match result {
                    Ok(Ok(())) => info!("Startup job finished"),
                    Ok(Err(e)) => error!("Startup job failed: {:#}", e),
                    Err(e) => error!("Startup job aborted: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                if let Some(job) = job.take() {
                    job.abort();
                }
                return Ok(());
            }
        }
    }
}

async fn wait_job(
    job: &mut Option<JoinHandle<anyhow::Result<()>>>,
) -> Result<anyhow::Result<()>, tokio::task::JoinError> {
    match job.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "meshhub",
            "--serial-port",
            "/dev/ttyACM0",
            "--reply-timeout",
            "750ms",
            "--stats-interval",
            "10s",
            "--discover",
            "refresh",
        ]);
        let mut config = HubConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.session.reply_timeout_ms, 750);
        assert_eq!(config.stats_interval_secs, 10);
        assert_eq!(config.serial.baud_rate, 460_800);
        assert_eq!(args.discover, Some(DiscoveryMode::Refresh));
    }

    #[test]
    fn test_firmware_requires_target() {
        assert!(Args::try_parse_from(["meshhub", "--firmware", "fw.bin"]).is_err());

        let args = Args::try_parse_from([
            "meshhub",
            "--firmware",
            "fw.bin",
            "--target",
            "0x00ABCD",
        ])
        .unwrap();
        assert_eq!(args.target, Some(0xABCD));
        assert_eq!(args.flash_address, DEFAULT_IMAGE_ADDRESS);
    }

    #[test]
    fn test_discover_conflicts_with_firmware() {
        assert!(Args::try_parse_from([
            "meshhub",
            "--discover",
            "fresh",
            "--firmware",
            "fw.bin",
            "--target",
            "0x10",
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_load_graph_for_other_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let store = JsonFileStore::new();

        let mut saved = Network::new(0x10);
        saved.set_edge_weight(0x10, 0x20, 0.5).unwrap();
        store.save_graph(&saved, &path).await.unwrap();

        let same = load_graph(&store, &path, 0x10).await.unwrap();
        assert!(same.contains_node(0x20));

        let other = load_graph(&store, &path, 0x99).await.unwrap();
        assert_eq!(other.local_node_id(), 0x99);
        assert_eq!(other.node_count(), 1);

        let missing = load_graph(&store, &dir.path().join("none.json"), 0x10)
            .await
            .unwrap();
        assert_eq!(missing.node_count(), 1);
    }
}
