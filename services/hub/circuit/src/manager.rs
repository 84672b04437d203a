//! Active circuit table and inbound demultiplexing.

use crate::circuit::CircuitReceiver;
use crate::{Circuit, CircuitError, CircuitStats};
use hub_session::SessionManager;
use hub_topology::{fmt_node_id, NetworkHandle};
use hub_wire::{Command, ConnectedPathCommand, ConnectedPathReply, ConnectedPathRequest, MeshNodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Circuit and listener settings
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Time allowed between Open and OpenAck
    pub handshake_timeout: Duration,
    /// Largest SendData payload
    pub chunk_size: usize,
    /// Node API port circuits are opened to; also the listen port in dynamic mode
    pub node_port: u16,
    /// `dynamic` or an IP address to bind every listener on
    pub bind_address: String,
    /// First port when binding on a fixed address
    pub base_port_offset: u16,
    /// Number of ports available from `base_port_offset`
    pub port_pool_size: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(3000),
            chunk_size: 512,
            node_port: 6053,
            bind_address: "dynamic".to_string(),
            base_port_offset: 20000,
            port_pool_size: 10000,
        }
    }
}

#[derive(Default)]
struct CircuitTable {
    circuits: Vec<Arc<Circuit>>,
    next_handle: u16,
}

impl CircuitTable {
    /// Next free handle after the last one issued, never 0
    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX {
            self.next_handle = self.next_handle.wrapping_add(1);
            let handle = self.next_handle;
            if handle != 0 && !self.circuits.iter().any(|c| c.handle() == handle) {
                return Some(handle);
            }
        }
        None
    }

    fn find(&self, handle: u16) -> Option<Arc<Circuit>> {
        self.circuits.iter().find(|c| c.handle() == handle).cloned()
    }
}

/// Owns every circuit multiplexed on the coordinator link
#[derive(Clone)]
pub struct CircuitManager {
    session: SessionManager,
    network: NetworkHandle,
    table: Arc<Mutex<CircuitTable>>,
    stats: CircuitStats,
    config: CircuitConfig,
}

impl CircuitManager {
    /// Create a manager with an empty table
    pub fn new(session: SessionManager, network: NetworkHandle, config: CircuitConfig) -> Self {
        Self {
            session,
            network,
            table: Arc::new(Mutex::new(CircuitTable::default())),
            stats: CircuitStats::new(),
            config,
        }
    }

    /// Settings
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Statistics table
    pub fn stats(&self) -> &CircuitStats {
        &self.stats
    }

    /// Graph used for circuit paths
    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    /// Number of circuits in the table
    pub async fn active_count(&self) -> usize {
        self.table.lock().await.circuits.len()
    }

    /// Reset every circuit the coordinator still remembers
    pub fn clear_connections(&self) -> Result<(), CircuitError> {
        self.session.send(&Command::ConnectedPath(
            ConnectedPathRequest::clear_connections(),
        ))?;
        info!("Cleared remote circuit state");
        Ok(())
    }

    /// Allocate a circuit to `target:port` and send Open.
    ///
    /// On failure the circuit is removed again.
    pub async fn open_circuit(
        &self,
        target: MeshNodeId,
        port: u16,
    ) -> Result<(Arc<Circuit>, CircuitReceiver), CircuitError> {
        let (circuit, receiver) = {
            let mut table = self.table.lock().await;
            let handle = table.allocate().ok_or(CircuitError::HandlesExhausted)?;
            let (circuit, receiver) = Circuit::new(
                handle,
                target,
                port,
                self.config.chunk_size,
                self.session.clone(),
            );
            let circuit = Arc::new(circuit);
            table.circuits.push(circuit.clone());
            (circuit, receiver)
        };

        if let Err(e) = circuit.open_connection_async(&self.network).await {
            self.release(circuit.handle()).await;
            return Err(e);
        }
        Ok((circuit, receiver))
    }

    /// Drop a circuit from the table
    pub async fn release(&self, handle: u16) {
        let mut table = self.table.lock().await;
        table.circuits.retain(|c| c.handle() != handle);
        debug!(
            "Circuit {} released, {} remaining",
            handle,
            table.circuits.len()
        );
    }

    /// Route a connected-path reply to its circuit.
    ///
    /// Unknown handles are answered with InvalidHandle so the node drops its
    /// side, except for replies that already tear a circuit down.
    pub async fn handle_incoming_reply(&self, reply: ConnectedPathReply) {
        let circuit = self.table.lock().await.find(reply.handle);
        match circuit {
            Some(circuit) => circuit.handle_reply(reply),
            None => {
                warn!(
                    "No circuit for handle {} ({:?})",
                    reply.handle, reply.command
                );
                if matches!(
                    reply.command,
                    ConnectedPathCommand::InvalidHandle | ConnectedPathCommand::Disconnect
                ) {
                    return;
                }
                let request = ConnectedPathRequest::invalid_handle(reply.handle);
                if let Err(e) = self.session.send(&Command::ConnectedPath(request)) {
                    warn!("Failed to send InvalidHandle {}: {}", reply.handle, e);
                }
            }
        }
    }

    /// Circuits currently open to `target`
    pub async fn circuits_to(&self, target: MeshNodeId) -> Vec<Arc<Circuit>> {
        self.table
            .lock()
            .await
            .circuits
            .iter()
            .filter(|c| c.target() == target)
            .cloned()
            .collect()
    }

    /// Invalidate every circuit to `target`
    pub async fn drop_node(&self, target: MeshNodeId) {
        for circuit in self.circuits_to(target).await {
            if let Err(e) = circuit.disconnect() {
                warn!("Disconnect of circuit {} failed: {}", circuit.handle(), e);
            }
        }
        debug!("Dropped circuits to {}", fmt_node_id(target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_session::SessionConfig;

    #[tokio::test]
    async fn test_allocate_skips_zero_and_in_use() {
        let (hub, _fake) = tokio::io::duplex(64);
        let (session, _push) = SessionManager::start(hub, SessionConfig::default());

        let mut table = CircuitTable::default();
        assert_eq!(table.allocate(), Some(1));

        let (c2, _rx) = Circuit::new(2, 5, 6053, 512, session.clone());
        table.circuits.push(Arc::new(c2));
        assert_eq!(table.allocate(), Some(3));

        table.next_handle = u16::MAX - 1;
        assert_eq!(table.allocate(), Some(u16::MAX));
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), Some(3));
    }
}
