//! Per-node TCP listeners feeding client workers.

use crate::{serve_connection, CircuitConfig, CircuitError, CircuitManager};
use hub_topology::{fmt_node_id, node_id_to_ip, Network, NetworkHandle, SubscriptionId};
use hub_wire::MeshNodeId;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Listen address for `node`.
///
/// In `dynamic` mode every node gets its own loopback address derived from
/// its id, on the node API port. Otherwise all listeners share the configured
/// address and the port is picked from the pool by node id.
pub fn listen_addr(config: &CircuitConfig, node: MeshNodeId) -> Result<SocketAddr, CircuitError> {
    if config.bind_address == "dynamic" {
        return Ok(SocketAddr::new(
            IpAddr::V4(node_id_to_ip(node)),
            config.node_port,
        ));
    }

    let ip: IpAddr = config
        .bind_address
        .parse()
        .map_err(|_| CircuitError::BindAddress(config.bind_address.clone()))?;
    if config.port_pool_size == 0 {
        return Err(CircuitError::BindAddress("empty port pool".to_string()));
    }
    let port = u32::from(config.base_port_offset) + node % config.port_pool_size;
    let port = u16::try_from(port)
        .map_err(|_| CircuitError::BindAddress(format!("port {} for node {}", port, fmt_node_id(node))))?;
    Ok(SocketAddr::new(ip, port))
}

/// Nodes that get a listener: enabled and not the coordinator
fn listen_nodes(network: &Network) -> Vec<MeshNodeId> {
    let local = network.local_node_id();
    let mut nodes: Vec<_> = network
        .in_use_nodes()
        .into_iter()
        .filter(|n| *n != local)
        .collect();
    nodes.sort_unstable();
    nodes
}

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Keeps one listener per reachable node
pub struct CircuitServer {
    manager: CircuitManager,
    listeners: Mutex<HashMap<MeshNodeId, Listener>>,
}

impl CircuitServer {
    /// Create a server without listeners
    pub fn new(manager: CircuitManager) -> Self {
        Self {
            manager,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Circuit manager used by the workers
    pub fn manager(&self) -> &CircuitManager {
        &self.manager
    }

    /// Bind the listener for `node`, returning its address.
    ///
    /// Returns the existing address when the node already has one.
    pub async fn start_listener(&self, node: MeshNodeId) -> Result<SocketAddr, CircuitError> {
        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(&node) {
            return Ok(existing.addr);
        }

        let addr = listen_addr(self.manager.config(), node)?;
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Listening for {} on {}", fmt_node_id(node), addr);

        let task = tokio::spawn(accept_loop(listener, self.manager.clone(), node));
        listeners.insert(node, Listener { addr, task });
        Ok(addr)
    }

    /// Close the listener of `node` and its open circuits
    pub async fn stop_listener(&self, node: MeshNodeId) -> bool {
        let removed = self.listeners.lock().await.remove(&node);
        match removed {
            Some(listener) => {
                listener.task.abort();
                self.manager.drop_node(node).await;
                info!("Stopped listening for {} on {}", fmt_node_id(node), listener.addr);
                true
            }
            None => false,
        }
    }

    /// Make the listener set equal to `nodes`
    pub async fn refresh_nodes(&self, nodes: &[MeshNodeId]) {
        let current: Vec<MeshNodeId> = self.listeners.lock().await.keys().copied().collect();

        for node in current.iter().filter(|n| !nodes.contains(n)) {
            self.stop_listener(*node).await;
        }
        for node in nodes.iter().filter(|n| !current.contains(n)) {
            if let Err(e) = self.start_listener(*node).await {
                warn!("Cannot listen for {}: {}", fmt_node_id(*node), e);
            }
        }
    }

    /// Listen for every enabled node of `network`
    pub async fn refresh(&self, network: &Network) {
        self.refresh_nodes(&listen_nodes(network)).await;
    }

    /// Current listeners ordered by node id
    pub async fn listening(&self) -> Vec<(MeshNodeId, SocketAddr)> {
        let mut all: Vec<_> = self
            .listeners
            .lock()
            .await
            .iter()
            .map(|(node, l)| (*node, l.addr))
            .collect();
        all.sort_by_key(|(node, _)| *node);
        all
    }

    /// Close every listener
    pub async fn stop_all(&self) {
        let nodes: Vec<MeshNodeId> = self.listeners.lock().await.keys().copied().collect();
        for node in nodes {
            self.stop_listener(node).await;
        }
    }

    /// Refresh the listeners whenever `network` changes.
    ///
    /// Bursts of changes are coalesced; only the latest node set is applied.
    pub fn watch(self: Arc<Self>, network: &NetworkHandle) -> SubscriptionId {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<MeshNodeId>>();
        tokio::spawn(async move {
            while let Some(mut nodes) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    nodes = newer;
                }
                debug!("Refreshing listeners for {} nodes", nodes.len());
                self.refresh_nodes(&nodes).await;
            }
        });

        network.subscribe(Arc::new(move |net: &Network| {
            let _ = tx.send(listen_nodes(net));
        }))
    }
}

async fn accept_loop(listener: TcpListener, manager: CircuitManager, node: MeshNodeId) {
    let port = manager.config().node_port;
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("Accepted {} for {}", peer, fmt_node_id(node));
                tokio::spawn(serve_connection(manager.clone(), socket, node, port));
            }
            Err(e) => {
                warn!("Accept for {} failed: {}", fmt_node_id(node), e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
