//! Per-client socket worker.

use crate::circuit::CircuitReceiver;
use crate::{CircuitManager, CircuitState};
use bytes::BytesMut;
use hub_topology::fmt_node_id;
use hub_wire::MeshNodeId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Chunks of client data held back while the handshake is pending
pub const PENDING_CHUNKS: usize = 4;

/// Tunnel one accepted client to `target:port` until either side closes.
///
/// Client bytes read during the handshake are held back and flushed once the
/// node accepts the circuit. At most [`PENDING_CHUNKS`] chunks are held; past
/// that the client socket is not read until the circuit is active. A handshake that does not complete within the
/// configured timeout invalidates the circuit and closes the socket.
pub async fn serve_connection(
    manager: CircuitManager,
    socket: TcpStream,
    target: MeshNodeId,
    port: u16,
) {
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let stats = manager.stats().clone();
    stats.connection_started(target);

    let (circuit, receiver) = match manager.open_circuit(target, port).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(
                "Circuit to {} for {} not opened: {}",
                fmt_node_id(target),
                peer,
                e
            );
            stats.connection_failed(target);
            stats.connection_closed(target);
            return;
        }
    };
    let handle = circuit.handle();
    debug!("Client {} bound to circuit {}", peer, handle);

    let (mut reader, mut writer) = socket.into_split();
    let CircuitReceiver {
        data: mut inbound,
        mut state,
    } = receiver;
    let started = Instant::now();
    let handshake = tokio::time::sleep(manager.config().handshake_timeout);
    tokio::pin!(handshake);
    let mut active = false;
    let chunk_size = manager.config().chunk_size.max(1);
    let pending_limit = chunk_size * PENDING_CHUNKS;
    let mut pending = BytesMut::with_capacity(pending_limit);
    let mut buf = vec![0u8; chunk_size];

    loop {
        tokio::select! {
            read = reader.read(&mut buf[..read_room(active, pending.len(), pending_limit)]),
                if active || pending.len() < pending_limit =>
            {
                let n = match read {
                    Ok(0) => {
                        debug!("Client {} closed circuit {}", peer, handle);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Read from client {} failed: {}", peer, e);
                        break;
                    }
                };
                stats.add_bytes_in(target, n);
                // Held bytes go out first, when the state change is handled
                if !active {
                    if circuit.state() == CircuitState::Invalid {
                        break;
                    }
                    pending.extend_from_slice(&buf[..n]);
                } else if let Err(e) = circuit.send_data(&buf[..n]) {
                    warn!("Circuit {} send failed: {}", handle, e);
                    break;
                }
            }

            data = inbound.recv() => {
                let Some(data) = data else { break };
                if let Err(e) = writer.write_all(&data).await {
                    warn!("Write to client {} failed: {}", peer, e);
                    break;
                }
                stats.add_bytes_out(target, data.len());
            }

            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *state.borrow_and_update();
                match now {
                    CircuitState::Active if !active => {
                        active = true;
                        stats.handshake_completed(target, handle, started.elapsed());
                        info!(
                            "Circuit {} to {} active after {:?}",
                            handle,
                            fmt_node_id(target),
                            started.elapsed()
                        );
                        if !pending.is_empty() {
                            let held = pending.split();
                            if let Err(e) = circuit.send_data(&held) {
                                warn!("Circuit {} flush failed: {}", handle, e);
                                break;
                            }
                        }
                    }
                    CircuitState::Invalid => {
                        if !active {
                            stats.connection_failed(target);
                        }
                        debug!("Circuit {} invalidated, closing {}", handle, peer);
                        break;
                    }
                    _ => {}
                }
            }

            _ = &mut handshake, if !active => {
                warn!(
                    "Closing circuit {} to {}: no answer after {:?}",
                    handle,
                    fmt_node_id(target),
                    started.elapsed()
                );
                stats.connection_failed(target);
                circuit.invalidate();
                break;
            }
        }
    }

    if let Err(e) = circuit.disconnect() {
        debug!("Disconnect of circuit {} not sent: {}", handle, e);
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of client {} failed: {}", peer, e);
    }
    manager.release(handle).await;
    stats.connection_closed(target);
}

/// Bytes the next client read may take
fn read_room(active: bool, pending: usize, limit: usize) -> usize {
    if active {
        limit / PENDING_CHUNKS
    } else {
        limit.saturating_sub(pending).min(limit / PENDING_CHUNKS)
    }
}
