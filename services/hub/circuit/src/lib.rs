//! Connected-path virtual circuits for the mesh hub.
//!
//! Every in-use mesh node gets a local TCP listener. Each accepted client is
//! tunnelled to the node's API port through a circuit: a 16-bit handle
//! negotiated with the coordinator (Open, then OpenAck), after which client
//! bytes travel as SendData chunks and node bytes come back as SendData
//! replies demultiplexed by handle.
//!
//! ## Circuit states
//!
//! ```text
//! Init --open--> HandshakeStarted --OpenAck--> Active
//!                      |                         |
//!                      +--Nack/timeout--> Invalid <--Nack/InvalidHandle/Disconnect
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit;
pub mod manager;
pub mod server;
pub mod stats;
pub mod worker;

use hub_session::SessionError;
use hub_topology::{fmt_node_id, GraphError};
use hub_wire::{MeshNodeId, WireError};
use thiserror::Error;

// Re-export main types
pub use circuit::{Circuit, CircuitReceiver, CircuitState};
pub use manager::{CircuitConfig, CircuitManager};
pub use server::{listen_addr, CircuitServer};
pub use stats::{CircuitStats, NodeStats};
pub use worker::serve_connection;

/// Circuit errors
#[derive(Error, Debug)]
pub enum CircuitError {
    /// No usable path to the node
    #[error("routing error: {0}")]
    Routing(#[from] GraphError),

    /// Circuits to the coordinator itself are not supported
    #[error("node {} is the local node", fmt_node_id(*.0))]
    LocalTarget(MeshNodeId),

    /// Every handle is in use
    #[error("no free circuit handle")]
    HandlesExhausted,

    /// Data sent before OpenAck or after invalidation
    #[error("circuit {0} is not active")]
    NotActive(u16),

    /// Open was not acknowledged in time
    #[error("handshake timeout on circuit {0}")]
    HandshakeTimeout(u16),

    /// Frame could not be built
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// Coordinator link failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener address could not be derived
    #[error("invalid bind address: {0}")]
    BindAddress(String),
}
