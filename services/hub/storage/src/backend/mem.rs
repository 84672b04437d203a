//! In-memory graph store for development and testing

use crate::{GraphStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use hub_topology::{Network, NetworkSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Keeps snapshots in a map keyed by path
#[derive(Clone, Default)]
pub struct MemoryGraphStore {
    graphs: Arc<DashMap<PathBuf, NetworkSnapshot>>,
}

impl MemoryGraphStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored graphs
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// True when nothing has been saved
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn load_graph(&self, path: &Path) -> Result<Network, StorageError> {
        let snapshot = self
            .graphs
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(path.display().to_string()))?;
        Ok(Network::from_snapshot(snapshot)?)
    }

    async fn save_graph(&self, network: &Network, path: &Path) -> Result<(), StorageError> {
        debug!(
            "Storing graph in memory path={} nodes={}",
            path.display(),
            network.node_count()
        );
        self.graphs.insert(path.to_path_buf(), network.snapshot());
        Ok(())
    }
}
