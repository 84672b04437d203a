//! One handle-identified tunnel and its state machine.

use crate::CircuitError;
use bytes::Bytes;
use hub_session::SessionManager;
use hub_topology::{fmt_node_id, fmt_path, NetworkHandle};
use hub_wire::{
    Command, ConnectedPathCommand, ConnectedPathReply, ConnectedPathRequest, MeshNodeId,
    OpenTarget,
};
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Created, Open not sent yet
    Init,
    /// Open sent, waiting for OpenAck
    HandshakeStarted,
    /// Data may flow
    Active,
    /// Terminal, the client socket is closed
    Invalid,
}

/// Receiving side of a circuit, owned by the client worker
#[derive(Debug)]
pub struct CircuitReceiver {
    /// Data sent back by the node
    pub data: mpsc::UnboundedReceiver<Bytes>,
    /// State transitions since creation
    pub state: watch::Receiver<CircuitState>,
}

/// A virtual circuit to one node port
#[derive(Debug)]
pub struct Circuit {
    handle: u16,
    target: MeshNodeId,
    port: u16,
    chunk_size: usize,
    sequence: AtomicU16,
    state: watch::Sender<CircuitState>,
    inbound: mpsc::UnboundedSender<Bytes>,
    session: SessionManager,
}

impl Circuit {
    /// Create a circuit in `Init` with its receiving side
    pub fn new(
        handle: u16,
        target: MeshNodeId,
        port: u16,
        chunk_size: usize,
        session: SessionManager,
    ) -> (Self, CircuitReceiver) {
        let (inbound, data) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(CircuitState::Init);
        let circuit = Self {
            handle,
            target,
            port,
            chunk_size: chunk_size.max(1),
            sequence: AtomicU16::new(0),
            state,
            inbound,
            session,
        };
        let receiver = CircuitReceiver {
            data,
            state: state_rx,
        };
        (circuit, receiver)
    }

    /// Circuit handle
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Destination node
    pub fn target(&self) -> MeshNodeId {
        self.target
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state.subscribe()
    }

    /// Next sequence number, wraps and never yields 0
    fn next_sequence(&self) -> u16 {
        let step = |s: u16| match s.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        let prev = self
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(step(s)))
            .unwrap_or_else(|s| s);
        step(prev)
    }

    fn send_request(&self, request: ConnectedPathRequest) -> Result<(), CircuitError> {
        self.session.send(&Command::ConnectedPath(request))?;
        Ok(())
    }

    /// Send Open with the current path to the target
    pub async fn open_connection_async(&self, network: &NetworkHandle) -> Result<(), CircuitError> {
        let path = network.read().await.get_path(self.target)?;
        if path.len() <= 1 {
            return Err(CircuitError::LocalTarget(self.target));
        }
        let target = OpenTarget {
            port: self.port,
            path: path.after_local().to_vec(),
        };

        self.state.send_replace(CircuitState::HandshakeStarted);
        let request = ConnectedPathRequest::open(self.handle, self.next_sequence(), &target)?;
        if let Err(e) = self.send_request(request) {
            self.invalidate();
            return Err(e);
        }
        debug!(
            "Circuit {} opening to {} port {} via {}",
            self.handle,
            fmt_node_id(self.target),
            self.port,
            fmt_path(&path.nodes)
        );
        Ok(())
    }

    /// Send client bytes in chunks
    pub fn send_data(&self, data: &[u8]) -> Result<(), CircuitError> {
        if self.state() != CircuitState::Active {
            return Err(CircuitError::NotActive(self.handle));
        }
        for chunk in data.chunks(self.chunk_size) {
            let request = ConnectedPathRequest::send_data(
                self.handle,
                self.next_sequence(),
                Bytes::copy_from_slice(chunk),
            );
            self.send_request(request)?;
        }
        Ok(())
    }

    /// Tear the circuit down, telling the node when it was active
    pub fn disconnect(&self) -> Result<(), CircuitError> {
        let previous = self.state.send_replace(CircuitState::Invalid);
        if previous == CircuitState::Active {
            self.send_request(ConnectedPathRequest::disconnect(
                self.handle,
                self.next_sequence(),
            ))?;
            debug!("Circuit {} disconnected", self.handle);
        }
        Ok(())
    }

    /// Force the terminal state without notifying the node
    pub fn invalidate(&self) {
        self.state.send_replace(CircuitState::Invalid);
    }

    /// Apply a connected-path reply addressed to this handle
    pub fn handle_reply(&self, reply: ConnectedPathReply) {
        match reply.command {
            ConnectedPathCommand::SendData => {
                if !reply.data.is_empty() && self.inbound.send(reply.data).is_err() {
                    debug!("Circuit {} dropped data, client gone", self.handle);
                }
            }
            ConnectedPathCommand::OpenAck => {
                let mut accepted = false;
                self.state.send_modify(|state| {
                    if *state == CircuitState::HandshakeStarted {
                        *state = CircuitState::Active;
                        accepted = true;
                    } else {
                        *state = CircuitState::Invalid;
                    }
                });
                if accepted {
                    info!(
                        "Circuit {} to {} accepted",
                        self.handle,
                        fmt_node_id(self.target)
                    );
                } else {
                    error!("Circuit {} got OpenAck outside the handshake", self.handle);
                }
            }
            ConnectedPathCommand::OpenNack => {
                warn!(
                    "Circuit {} to {} refused",
                    self.handle,
                    fmt_node_id(self.target)
                );
                self.invalidate();
            }
            ConnectedPathCommand::SendDataNack
            | ConnectedPathCommand::InvalidHandle
            | ConnectedPathCommand::Disconnect => {
                debug!("Circuit {} closed by {:?}", self.handle, reply.command);
                self.invalidate();
            }
            other => {
                error!(
                    "Circuit {} got unexpected reply {:?}",
                    self.handle, other
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_session::SessionConfig;

    fn circuit() -> (Circuit, CircuitReceiver, tokio::io::DuplexStream) {
        let (hub, fake) = tokio::io::duplex(8192);
        let (session, _push) = SessionManager::start(hub, SessionConfig::default());
        let (circuit, rx) = Circuit::new(9, 0x22, 6053, 512, session);
        (circuit, rx, fake)
    }

    fn reply(command: ConnectedPathCommand, data: &'static [u8]) -> ConnectedPathReply {
        ConnectedPathReply {
            command,
            handle: 9,
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_sequence_skips_zero() {
        let (circuit, _rx, _fake) = circuit();
        assert_eq!(circuit.next_sequence(), 1);
        circuit.sequence.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(circuit.next_sequence(), u16::MAX);
        assert_eq!(circuit.next_sequence(), 1);
        assert_eq!(circuit.next_sequence(), 2);
    }

    #[tokio::test]
    async fn test_ack_only_accepted_during_handshake() {
        let (circuit, _rx, _fake) = circuit();
        circuit.handle_reply(reply(ConnectedPathCommand::OpenAck, b""));
        assert_eq!(circuit.state(), CircuitState::Invalid);

        let (circuit, _rx, _fake) = self::circuit();
        circuit.state.send_replace(CircuitState::HandshakeStarted);
        circuit.handle_reply(reply(ConnectedPathCommand::OpenAck, b""));
        assert_eq!(circuit.state(), CircuitState::Active);

        circuit.handle_reply(reply(ConnectedPathCommand::SendDataNack, b""));
        assert_eq!(circuit.state(), CircuitState::Invalid);
    }

    #[tokio::test]
    async fn test_inbound_data_forwarded() {
        let (circuit, mut rx, _fake) = circuit();
        circuit.state.send_replace(CircuitState::Active);
        circuit.handle_reply(reply(ConnectedPathCommand::SendData, b"abc"));
        circuit.handle_reply(reply(ConnectedPathCommand::SendData, b""));
        circuit.handle_reply(reply(ConnectedPathCommand::SendData, b"de"));
        assert_eq!(rx.data.recv().await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(rx.data.recv().await.unwrap(), Bytes::from_static(b"de"));
    }

    #[tokio::test]
    async fn test_send_requires_active() {
        let (circuit, _rx, _fake) = circuit();
        assert!(matches!(
            circuit.send_data(b"x"),
            Err(CircuitError::NotActive(9))
        ));
    }

    #[tokio::test]
    async fn test_open_to_local_node_fails() {
        let (circuit, _rx, _fake) = circuit();
        let network = NetworkHandle::new(hub_topology::Network::new(0x22));
        assert!(matches!(
            circuit.open_connection_async(&network).await,
            Err(CircuitError::LocalTarget(0x22))
        ));
        assert_eq!(circuit.state(), CircuitState::Init);
    }
}
