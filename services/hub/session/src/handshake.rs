//! Coordinator probe run once the link is up.

use crate::{SessionError, SessionManager};
use hub_routing::MeshProtocol;
use hub_topology::fmt_node_id;
use hub_wire::{Command, MeshNodeId, Reply};
use tracing::info;

/// Text the coordinator must echo back
pub const PROBE_TEXT: &str = "CIAO";

/// Identity of the serial-attached node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorInfo {
    /// Node id, becomes the graph's local node
    pub node_id: MeshNodeId,
    /// Firmware revision string
    pub firmware: String,
}

/// Check the coordinator answers, then read its node id and firmware.
///
/// The node id is stored as the session's local node.
pub async fn probe_coordinator(session: &SessionManager) -> Result<CoordinatorInfo, SessionError> {
    match direct(session, Command::Echo(PROBE_TEXT.to_string())).await? {
        Reply::Echo(text) if text == PROBE_TEXT => {}
        other => {
            return Err(SessionError::UnexpectedReply(format!(
                "echo probe answered with {:?}",
                other
            )))
        }
    }

    let node_id = match direct(session, Command::NodeId).await? {
        Reply::NodeId(id) => id,
        other => return Err(SessionError::UnexpectedReply(format!("{:?}", other))),
    };
    session.set_local_node(node_id);

    let firmware = match direct(session, Command::FirmRev).await? {
        Reply::FirmRev(rev) => rev,
        other => return Err(SessionError::UnexpectedReply(format!("{:?}", other))),
    };

    info!(
        "Coordinator {} answered, firmware {}",
        fmt_node_id(node_id),
        firmware
    );
    Ok(CoordinatorInfo { node_id, firmware })
}

async fn direct(session: &SessionManager, command: Command) -> Result<Reply, SessionError> {
    session
        .send_receive(&command, MeshProtocol::Direct, 0)
        .await
}
