//! Breadth-by-weight neighbour discovery.
//!
//! Every step takes the cheapest enabled node not yet visited, clears its
//! neighbour table, starts a radio scan, waits for it to finish and reads the
//! table back. Each row becomes a bidirectional edge; new nodes join the
//! candidate set.

use crate::retry::{with_retries, RETRY_TIMEOUTS};
use crate::ProcedureError;
use hub_routing::{build_frame, resolve_protocol, MeshProtocol};
use hub_session::SessionManager;
use hub_topology::{fmt_node_id, rssi_to_weight, Network, NetworkHandle};
use hub_wire::{Command, DiscoveryCommand, DiscoveryReply, DiscoveryTableItem, MeshNodeId, Reply};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time a scan is given before the table is read
pub const DEFAULT_SCAN_WAIT: Duration = Duration::from_secs(3);

/// Procedure state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Created, no step taken
    Init,
    /// Steps in progress
    Run,
    /// No candidate left
    Done,
    /// A step failed
    Error,
}

/// Starting graph of a discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Only the coordinator
    Fresh,
    /// The current network with every node marked undiscovered
    Refresh,
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMode::Fresh => write!(f, "fresh"),
            DiscoveryMode::Refresh => write!(f, "refresh"),
        }
    }
}

impl FromStr for DiscoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fresh" => Ok(DiscoveryMode::Fresh),
            "refresh" => Ok(DiscoveryMode::Refresh),
            other => Err(format!("unknown discovery mode {:?}", other)),
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Wait between StartDiscover and TableSize
    pub scan_wait: Duration,
    /// Protocol for remote nodes; Auto picks from the working graph
    pub protocol: MeshProtocol,
    /// Reply deadline of each attempt
    pub timeouts: Vec<Duration>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_wait: DEFAULT_SCAN_WAIT,
            protocol: MeshProtocol::Auto,
            timeouts: RETRY_TIMEOUTS.to_vec(),
        }
    }
}

/// Link quality to one neighbour of the node being scanned
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NeighbourWeight {
    /// Weight known before this scan
    pub current: Option<f64>,
    /// Weight measured by this scan
    pub next: Option<f64>,
}

impl NeighbourWeight {
    /// Change introduced by this scan, when both sides are known
    pub fn delta(&self) -> Option<f64> {
        Some(self.next? - self.current?)
    }
}

/// Discovery over the coordinator link
pub struct DiscoveryProcedure {
    session: SessionManager,
    network: NetworkHandle,
    config: DiscoveryConfig,
    state: DiscoveryState,
    graph: Network,
    current: Option<MeshNodeId>,
    neighbours: BTreeMap<MeshNodeId, NeighbourWeight>,
    visited: Vec<MeshNodeId>,
}

impl DiscoveryProcedure {
    /// Prepare a discovery whose result will be saved into `network`
    pub async fn new(
        session: SessionManager,
        network: NetworkHandle,
        mode: DiscoveryMode,
        config: DiscoveryConfig,
    ) -> Self {
        let graph = match mode {
            DiscoveryMode::Fresh => Network::new(network.read().await.local_node_id()),
            DiscoveryMode::Refresh => {
                let mut graph = network.copy().await;
                graph.clear_discovered();
                graph
            }
        };
        info!(
            "Discovery ({}) from {} over {} nodes",
            mode,
            fmt_node_id(graph.local_node_id()),
            graph.node_count()
        );

        Self {
            session,
            network,
            config,
            state: DiscoveryState::Init,
            graph,
            current: None,
            neighbours: BTreeMap::new(),
            visited: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Working graph
    pub fn graph(&self) -> &Network {
        &self.graph
    }

    /// Node of the last step
    pub fn current_node(&self) -> Option<MeshNodeId> {
        self.current
    }

    /// Neighbour table of the last step
    pub fn neighbours(&self) -> &BTreeMap<MeshNodeId, NeighbourWeight> {
        &self.neighbours
    }

    /// Nodes scanned so far, in order
    pub fn visited(&self) -> &[MeshNodeId] {
        &self.visited
    }

    /// Cheapest enabled node not yet scanned
    fn next_candidate(&self) -> Option<MeshNodeId> {
        self.graph
            .nodes()
            .filter(|n| n.in_use && !n.discovered)
            .filter_map(|n| self.graph.get_path(n.id).ok().map(|p| (n.id, p.weight)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }

    /// Scan one node.
    ///
    /// Returns the scanned node, or `None` once every reachable node has
    /// been visited.
    pub async fn step(&mut self) -> Result<Option<MeshNodeId>, ProcedureError> {
        match self.state {
            DiscoveryState::Done => return Ok(None),
            DiscoveryState::Error => return Err(ProcedureError::InvalidState("discovery failed")),
            _ => self.state = DiscoveryState::Run,
        }

        let Some(node) = self.next_candidate() else {
            info!("Discovery done, {} nodes visited", self.visited.len());
            self.state = DiscoveryState::Done;
            self.current = None;
            return Ok(None);
        };
        self.graph.set_node_discovered(node, true)?;
        self.current = Some(node);
        self.visited.push(node);
        self.seed_neighbours(node);

        match self.scan(node).await {
            Ok(rows) => {
                if let Err(e) = self.apply_rows(node, &rows) {
                    self.state = DiscoveryState::Error;
                    return Err(e);
                }
                self.log_neighbours(node);
                Ok(Some(node))
            }
            Err(e) => {
                warn!("Discovery of {} failed: {}", fmt_node_id(node), e);
                self.state = DiscoveryState::Error;
                Err(e)
            }
        }
    }

    /// Step until no candidate remains; returns the number of nodes scanned
    pub async fn run(&mut self) -> Result<usize, ProcedureError> {
        while self.step().await?.is_some() {}
        Ok(self.visited.len())
    }

    /// Publish the working graph into the shared network
    pub async fn save(&self) -> Result<(), ProcedureError> {
        if self.state != DiscoveryState::Done {
            return Err(ProcedureError::InvalidState("discovery has not completed"));
        }
        self.network.replace(self.graph.clone()).await;
        info!(
            "Discovery result saved, {} nodes",
            self.graph.node_count()
        );
        Ok(())
    }

    fn seed_neighbours(&mut self, node: MeshNodeId) {
        self.neighbours.clear();
        for (neighbour, weight_to) in self.graph.neighbors(node) {
            let weight_from = self.graph.edge_weight(neighbour, node).unwrap_or(weight_to);
            self.neighbours.insert(
                neighbour,
                NeighbourWeight {
                    current: Some(weight_to.min(weight_from)),
                    next: None,
                },
            );
        }
    }

    async fn scan(&self, node: MeshNodeId) -> Result<Vec<DiscoveryTableItem>, ProcedureError> {
        info!("Start discovery of node {}", fmt_node_id(node));
        self.request(node, DiscoveryCommand::ResetTable).await?;
        self.request(node, DiscoveryCommand::start_default()).await?;
        tokio::time::sleep(self.config.scan_wait).await;

        let size = match self.request(node, DiscoveryCommand::TableSize).await? {
            DiscoveryReply::TableSize(size) => size,
            other => return Err(unexpected(&other)),
        };
        debug!("Node {} table size is {}", fmt_node_id(node), size);

        let mut rows = Vec::with_capacity(size as usize);
        for index in 0..size {
            match self.request(node, DiscoveryCommand::TableItem { index }).await? {
                DiscoveryReply::TableItem(item) => {
                    debug!(
                        "Row {} node {} rssi1 {} rssi2 {}",
                        index,
                        fmt_node_id(item.node_id),
                        item.rssi1,
                        item.rssi2
                    );
                    rows.push(item);
                }
                other => return Err(unexpected(&other)),
            }
        }
        Ok(rows)
    }

    fn apply_rows(
        &mut self,
        node: MeshNodeId,
        rows: &[DiscoveryTableItem],
    ) -> Result<(), ProcedureError> {
        for row in rows {
            if row.node_id == 0 || row.node_id == node {
                continue;
            }
            let weight = rssi_to_weight(row.rssi1).min(rssi_to_weight(row.rssi2));
            self.neighbours.entry(row.node_id).or_default().next = Some(weight);
            self.graph
                .change_edge_weight(node, row.node_id, weight, weight)?;
        }
        Ok(())
    }

    fn log_neighbours(&self, node: MeshNodeId) {
        info!(
            "Neighbours of {}: {}",
            fmt_node_id(node),
            self.neighbours.len()
        );
        for (id, w) in &self.neighbours {
            info!(
                "  {} prev {} curr {} delta {}",
                fmt_node_id(*id),
                fmt_weight(w.current),
                fmt_weight(w.next),
                fmt_weight(w.delta())
            );
        }
    }

    async fn request(
        &self,
        node: MeshNodeId,
        command: DiscoveryCommand,
    ) -> Result<DiscoveryReply, ProcedureError> {
        let command = Command::Discovery(command);
        let protocol = resolve_protocol(self.config.protocol, node, Some(&self.graph));
        let frame = build_frame(&command, protocol, node, Some(&self.graph))?;
        let what = format!("{:?} to {}", command, fmt_node_id(node));

        with_retries(&what, &self.config.timeouts, |timeout| {
            let frame = frame.clone();
            async move {
                let reply = self.session.send_receive_frame(frame, Some(timeout)).await?;
                match Reply::from_frame(&reply)? {
                    Reply::Discovery(reply) => Ok(reply),
                    other => Err(unexpected(&other)),
                }
            }
        })
        .await
    }
}

fn unexpected(reply: &impl fmt::Debug) -> ProcedureError {
    ProcedureError::UnexpectedReply(format!("{:?}", reply))
}

fn fmt_weight(weight: Option<f64>) -> String {
    weight
        .map(|w| format!("{:.2}", w))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use hub_session::SessionConfig;
    use hub_wire::{Envelope, FrameDecoder};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Neighbour tables keyed by node, rows are (id, rssi1, rssi2)
    type Mesh = HashMap<MeshNodeId, Vec<(MeshNodeId, i16, i16)>>;

    /// Answers discovery requests for a simulated mesh rooted at node 1
    async fn fake_mesh(mut io: DuplexStream, mesh: Mesh, log: Arc<Mutex<Vec<Envelope>>>) {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        loop {
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                let envelope = Envelope::parse(&frame).unwrap();
                let target = match &envelope {
                    Envelope::Direct(_) => 1,
                    Envelope::Unicast { target, .. } | Envelope::Multipath { target, .. } => *target,
                };
                let command = Command::decode(envelope.inner()).unwrap();
                log.lock().unwrap().push(envelope);

                let table = mesh.get(&target).cloned().unwrap_or_default();
                let reply = match command {
                    Command::Discovery(DiscoveryCommand::ResetTable) => DiscoveryReply::ResetTable,
                    Command::Discovery(DiscoveryCommand::StartDiscover { .. }) => {
                        DiscoveryReply::StartDiscover
                    }
                    Command::Discovery(DiscoveryCommand::TableSize) => {
                        DiscoveryReply::TableSize(table.len() as u8)
                    }
                    Command::Discovery(DiscoveryCommand::TableItem { index }) => {
                        let (node_id, rssi1, rssi2) = table[index as usize];
                        DiscoveryReply::TableItem(DiscoveryTableItem {
                            index,
                            node_id,
                            rssi1,
                            rssi2,
                            flags: 0,
                        })
                    }
                    other => panic!("unexpected command {:?}", other),
                };
                let frame = Reply::Discovery(reply).to_frame().unwrap();
                io.write_all(&frame.encode()).await.unwrap();
            }
            if io.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                return;
            }
        }
    }

    fn mesh() -> Mesh {
        let mut mesh = Mesh::new();
        mesh.insert(1, vec![(2, -15, -16), (3, -2, -2)]);
        mesh.insert(2, vec![(1, -15, -15), (4, -12, -10)]);
        mesh.insert(3, vec![(1, -2, -2)]);
        mesh.insert(4, vec![(2, -11, -11)]);
        mesh
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            scan_wait: Duration::from_millis(5),
            ..DiscoveryConfig::default()
        }
    }

    async fn start(
        mesh: Mesh,
        network: Network,
        mode: DiscoveryMode,
    ) -> (DiscoveryProcedure, Arc<Mutex<Vec<Envelope>>>) {
        let (hub, fake) = tokio::io::duplex(8192);
        let session_config = SessionConfig {
            write_guard: Duration::from_millis(1),
            ..SessionConfig::default()
        };
        let (session, _push) = SessionManager::start(hub, session_config);
        session.set_local_node(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(fake_mesh(fake, mesh, log.clone()));

        let handle = NetworkHandle::new(network);
        let procedure = DiscoveryProcedure::new(session, handle, mode, config()).await;
        (procedure, log)
    }

    #[tokio::test]
    async fn test_fresh_discovery_builds_graph() {
        let (mut procedure, log) = start(mesh(), Network::new(1), DiscoveryMode::Fresh).await;
        assert_eq!(procedure.state(), DiscoveryState::Init);

        assert_eq!(procedure.run().await.unwrap(), 4);
        assert_eq!(procedure.state(), DiscoveryState::Done);
        // Cheapest first: node 4 behind node 2 still beats node 3
        assert_eq!(procedure.visited(), &[1, 2, 4, 3]);

        let graph = procedure.graph();
        assert!(graph.nodes().all(|n| n.discovered));
        // Node 4 only reachable through node 2
        assert_eq!(graph.get_path(4).unwrap().nodes, vec![1, 2, 4]);
        let merged = (rssi_to_weight(-12) + rssi_to_weight(-11)) / 2.0;
        assert!((graph.edge_weight(2, 4).unwrap() - merged).abs() < 1e-9);
        assert!((graph.edge_weight(4, 2).unwrap() - merged).abs() < 1e-9);

        // Local node scanned directly, node 4 source routed via 2
        let log = log.lock().unwrap();
        assert!(matches!(log[0], Envelope::Direct(_)));
        assert!(log.iter().any(|e| matches!(
            e,
            Envelope::Multipath { target: 4, path, .. } if path == &vec![2]
        )));
        assert!(log.iter().any(|e| matches!(e, Envelope::Unicast { target: 2, .. })));
    }

    #[tokio::test]
    async fn test_neighbour_table_tracks_change() {
        let mut start_graph = Network::new(1);
        start_graph.set_edge_weight(1, 2, 0.9).unwrap();
        start_graph.set_edge_weight(2, 1, 0.8).unwrap();
        let (mut procedure, _log) = start(mesh(), start_graph, DiscoveryMode::Refresh).await;

        assert_eq!(procedure.step().await.unwrap(), Some(1));
        let to_2 = procedure.neighbours()[&2];
        assert_eq!(to_2.current, Some(0.8));
        let measured = rssi_to_weight(-16);
        assert_eq!(to_2.next, Some(measured));
        assert!((to_2.delta().unwrap() - (measured - 0.8)).abs() < 1e-9);

        let to_3 = procedure.neighbours()[&3];
        assert_eq!(to_3.current, None);
        assert_eq!(to_3.delta(), None);
    }

    #[tokio::test]
    async fn test_save_requires_done() {
        let (mut procedure, _log) = start(mesh(), Network::new(1), DiscoveryMode::Fresh).await;
        assert!(matches!(
            procedure.save().await,
            Err(ProcedureError::InvalidState(_))
        ));

        procedure.run().await.unwrap();
        procedure.save().await.unwrap();
        assert_eq!(procedure.network.read().await.node_count(), 4);
        assert_eq!(procedure.step().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_moves_to_error() {
        let (hub, _fake) = tokio::io::duplex(8192);
        let (session, _push) = SessionManager::start(hub, SessionConfig::default());
        let network = NetworkHandle::new(Network::new(1));
        let mut procedure =
            DiscoveryProcedure::new(session, network, DiscoveryMode::Fresh, config()).await;

        let err = procedure.step().await.unwrap_err();
        assert!(matches!(
            err,
            ProcedureError::Session(hub_session::SessionError::ReplyTimeout)
        ));
        assert_eq!(procedure.state(), DiscoveryState::Error);
        assert!(matches!(
            procedure.step().await,
            Err(ProcedureError::InvalidState(_))
        ));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("fresh".parse::<DiscoveryMode>().unwrap(), DiscoveryMode::Fresh);
        assert_eq!("Refresh".parse::<DiscoveryMode>().unwrap(), DiscoveryMode::Refresh);
        assert!("full".parse::<DiscoveryMode>().is_err());
    }
}
