//! Protocol selection and routing envelopes for the mesh hub.
//!
//! A command addressed to a mesh node is wrapped according to the length of
//! the lowest cost path from the coordinator: the coordinator itself is
//! spoken to directly, a neighbour through a unicast envelope and anything
//! further away through a multipath envelope carrying the intermediate hops.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod protocol;
pub mod selector;

use hub_topology::GraphError;
use hub_wire::{MeshNodeId, WireError};
use thiserror::Error;

// Re-export main types
pub use protocol::MeshProtocol;
pub use selector::{build_envelope, build_frame, find_best_protocol, resolve_protocol};

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// Multipath needs a graph to compute hops
    #[error("multipath requested for {} without a network graph", hub_topology::fmt_node_id(*.0))]
    NoNetwork(MeshNodeId),

    /// Multipath to the coordinator itself
    #[error("target {} is the local node, use the direct protocol", hub_topology::fmt_node_id(*.0))]
    LocalTarget(MeshNodeId),

    /// Path lookup failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Frame encoding failed
    #[error(transparent)]
    Wire(#[from] WireError),
}
