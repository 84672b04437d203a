//! Per-node circuit statistics

use dashmap::DashMap;
use hub_topology::fmt_node_id;
use hub_wire::MeshNodeId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Counters for the circuits of one node
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Circuits currently open
    pub active: u32,
    /// Circuits that reached Active
    pub opened: u64,
    /// Circuits that never reached Active
    pub failed: u64,
    /// Bytes read from clients
    pub bytes_in: u64,
    /// Bytes written to clients
    pub bytes_out: u64,
    /// Handle of the most recent accepted circuit
    pub last_handle: u16,
    /// Open to OpenAck time of the most recent accepted circuit
    pub last_handshake: Option<Duration>,
    /// When the most recent client connected
    pub last_started: Option<Instant>,
}

/// Shared statistics table
#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    nodes: Arc<DashMap<MeshNodeId, NodeStats>>,
}

impl CircuitStats {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// A client connected
    pub fn connection_started(&self, node: MeshNodeId) {
        let mut entry = self.nodes.entry(node).or_default();
        entry.active += 1;
        entry.last_started = Some(Instant::now());
    }

    /// The node accepted the circuit
    pub fn handshake_completed(&self, node: MeshNodeId, handle: u16, elapsed: Duration) {
        let mut entry = self.nodes.entry(node).or_default();
        entry.opened += 1;
        entry.last_handle = handle;
        entry.last_handshake = Some(elapsed);
    }

    /// The circuit never became active
    pub fn connection_failed(&self, node: MeshNodeId) {
        self.nodes.entry(node).or_default().failed += 1;
    }

    /// The client connection ended
    pub fn connection_closed(&self, node: MeshNodeId) {
        let mut entry = self.nodes.entry(node).or_default();
        entry.active = entry.active.saturating_sub(1);
    }

    /// Bytes read from a client
    pub fn add_bytes_in(&self, node: MeshNodeId, n: usize) {
        self.nodes.entry(node).or_default().bytes_in += n as u64;
    }

    /// Bytes written to a client
    pub fn add_bytes_out(&self, node: MeshNodeId, n: usize) {
        self.nodes.entry(node).or_default().bytes_out += n as u64;
    }

    /// Statistics of one node
    pub fn get(&self, node: MeshNodeId) -> Option<NodeStats> {
        self.nodes.get(&node).map(|e| e.value().clone())
    }

    /// All nodes ordered by id
    pub fn snapshot(&self) -> Vec<(MeshNodeId, NodeStats)> {
        let mut all: Vec<_> = self
            .nodes
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Log one line per node
    pub fn log_summary(&self) {
        for (node, stats) in self.snapshot() {
            info!(
                "{} active={} opened={} failed={} in={} out={} handle={} handshake={:?}",
                fmt_node_id(node),
                stats.active,
                stats.opened,
                stats.failed,
                stats.bytes_in,
                stats.bytes_out,
                stats.last_handle,
                stats.last_handshake
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters() {
        let stats = CircuitStats::new();
        stats.connection_started(7);
        stats.connection_started(7);
        stats.handshake_completed(7, 3, Duration::from_millis(40));
        stats.connection_failed(7);
        stats.add_bytes_in(7, 10);
        stats.add_bytes_out(7, 4);
        stats.connection_closed(7);

        let s = stats.get(7).unwrap();
        assert_eq!(s.active, 1);
        assert_eq!((s.opened, s.failed), (1, 1));
        assert_eq!((s.bytes_in, s.bytes_out), (10, 4));
        assert_eq!(s.last_handle, 3);
        assert_eq!(s.last_handshake, Some(Duration::from_millis(40)));

        stats.connection_closed(7);
        stats.connection_closed(7);
        assert_eq!(stats.get(7).unwrap().active, 0);
        assert!(stats.get(8).is_none());
    }
}
