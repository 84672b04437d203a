//! JSON snapshot file backend

use crate::{GraphStore, StorageError};
use async_trait::async_trait;
use hub_topology::{Network, NetworkSnapshot};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Stores each graph as a pretty-printed JSON snapshot.
///
/// Writes go to `<path>.tmp` and are renamed over the target, so a crash
/// mid-save leaves the previous snapshot intact. With `keep_backup` the
/// previous snapshot is also copied to `<path>.bak` first.
#[derive(Clone, Debug, Default)]
pub struct JsonFileStore {
    keep_backup: bool,
}

impl JsonFileStore {
    /// Create a store that does not keep backups
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a `.bak` copy of the snapshot being replaced
    pub fn with_backup(mut self, keep_backup: bool) -> Self {
        self.keep_backup = keep_backup;
        self
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl GraphStore for JsonFileStore {
    async fn load_graph(&self, path: &Path) -> Result<Network, StorageError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: NetworkSnapshot = serde_json::from_slice(&data)?;
        let network = Network::from_snapshot(snapshot)?;
        info!(
            "Loaded graph from {} ({} nodes, local N{:06X})",
            path.display(),
            network.node_count(),
            network.local_node_id()
        );
        Ok(network)
    }

    async fn save_graph(&self, network: &Network, path: &Path) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(&network.snapshot())?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.keep_backup && tokio::fs::try_exists(path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::copy(path, sibling(path, ".bak")).await {
                warn!("Failed to back up {}: {}", path.display(), e);
            }
        }

        let tmp = sibling(path, ".tmp");
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Saved graph to {} ({} bytes)", path.display(), data.len());
        Ok(())
    }
}
