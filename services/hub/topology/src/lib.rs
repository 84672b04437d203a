//! Mesh graph, shortest paths and change notification for the hub.
//!
//! This crate keeps the directed, weighted graph of mesh nodes rooted at the
//! serial coordinator. Edge weights are derived from radio RSSI readings and
//! tracked independently per direction; paths are computed with Dijkstra from
//! the coordinator.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod network;
pub mod nodeid;

use hub_wire::MeshNodeId;
use thiserror::Error;

// Re-export main types
pub use handle::{NetworkHandle, NetworkObserver, SubscriptionId};
pub use network::{rssi_to_weight, Edge, Network, NetworkSnapshot, Node, Path, LOCAL_NODE_TAG};
pub use nodeid::{fmt_node_id, fmt_path, node_id_to_ip, parse_node_id};

/// Graph and path errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Node is not part of the graph
    #[error("node {} not found", fmt_node_id(*.0))]
    NodeNotFound(MeshNodeId),

    /// Node is administratively disabled
    #[error("node {} is not in use", fmt_node_id(*.0))]
    NodeNotInUse(MeshNodeId),

    /// Node cannot be reached from the coordinator
    #[error("no path to node {}", fmt_node_id(*.0))]
    NoPath(MeshNodeId),

    /// Operation not allowed on the coordinator vertex
    #[error("node {} is the local node", fmt_node_id(*.0))]
    LocalNode(MeshNodeId),

    /// Edge from a node to itself
    #[error("self loop on node {}", fmt_node_id(*.0))]
    SelfLoop(MeshNodeId),

    /// Weight outside (0, 1]
    #[error("invalid edge weight {0}")]
    InvalidWeight(f64),

    /// Unparsable node id text
    #[error("invalid node id {0:?}")]
    InvalidNodeId(String),
}
