//! Path based protocol selection and envelope building

use crate::{MeshProtocol, RoutingError};
use bytes::Bytes;
use hub_topology::{fmt_node_id, Network};
use hub_wire::{ApiFrame, Command, Envelope, MeshNodeId};
use tracing::debug;

/// Choose the encoding for `target` from its path length.
///
/// Falls back to unicast when there is no graph or the path lookup fails.
pub fn find_best_protocol(target: MeshNodeId, network: Option<&Network>) -> MeshProtocol {
    let Some(network) = network else {
        return MeshProtocol::Unicast;
    };
    if target == network.local_node_id() {
        return MeshProtocol::Direct;
    }
    match network.get_path(target) {
        Ok(path) => match path.len() {
            0 | 1 => MeshProtocol::Direct,
            2 => MeshProtocol::Unicast,
            _ => MeshProtocol::Multipath,
        },
        Err(e) => {
            debug!("No path to {} ({}), using unicast", fmt_node_id(target), e);
            MeshProtocol::Unicast
        }
    }
}

/// Resolve `Auto` and the implicit direct targets.
///
/// Target 0 and the coordinator id always resolve to direct.
pub fn resolve_protocol(
    requested: MeshProtocol,
    target: MeshNodeId,
    network: Option<&Network>,
) -> MeshProtocol {
    if target == 0 || network.is_some_and(|n| n.local_node_id() == target) {
        return MeshProtocol::Direct;
    }
    match requested {
        MeshProtocol::Auto => find_best_protocol(target, network),
        other => other,
    }
}

/// Wrap an encoded payload for `target`
pub fn build_envelope(
    inner: Bytes,
    protocol: MeshProtocol,
    target: MeshNodeId,
    network: Option<&Network>,
) -> Result<Envelope, RoutingError> {
    match resolve_protocol(protocol, target, network) {
        MeshProtocol::Direct | MeshProtocol::Auto => Ok(Envelope::Direct(inner)),
        MeshProtocol::Unicast => Ok(Envelope::Unicast { target, inner }),
        MeshProtocol::Multipath => {
            let network = network.ok_or(RoutingError::NoNetwork(target))?;
            let path = network.get_path(target)?;
            if path.len() <= 1 {
                return Err(RoutingError::LocalTarget(target));
            }
            Ok(Envelope::Multipath {
                target,
                path: path.intermediate().to_vec(),
                inner,
            })
        }
    }
}

/// Encode `command` and wrap it for `target`
pub fn build_frame(
    command: &Command,
    protocol: MeshProtocol,
    target: MeshNodeId,
    network: Option<&Network>,
) -> Result<ApiFrame, RoutingError> {
    let envelope = build_envelope(command.encode()?, protocol, target, network)?;
    Ok(envelope.to_frame()?)
}
