//! Graph persistence for the mesh hub.
//!
//! The live network is saved as a JSON snapshot after every change and read
//! back at startup. Backends implement [`GraphStore`]; the file backend is
//! used by the binary, the in-memory backend by tests and dry runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use hub_topology::{GraphError, Network};
use std::path::Path;
use thiserror::Error;

// Re-export main types
pub use backend::file::JsonFileStore;
pub use backend::mem::MemoryGraphStore;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Snapshot does not describe a valid graph
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),
    /// Nothing stored under the path
    #[error("Graph not found: {0}")]
    NotFound(String),
}

/// Load and save network graphs
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Read the graph stored under `path`
    async fn load_graph(&self, path: &Path) -> Result<Network, StorageError>;

    /// Replace whatever is stored under `path` with `network`
    async fn save_graph(&self, network: &Network, path: &Path) -> Result<(), StorageError>;

    /// Load the graph, or build a fresh one rooted at `local` when none is stored
    async fn load_or_new(&self, path: &Path, local: u32) -> Result<Network, StorageError> {
        match self.load_graph(path).await {
            Ok(network) => Ok(network),
            Err(StorageError::NotFound(_)) => Ok(Network::new(local)),
            Err(e) => Err(e),
        }
    }
}
