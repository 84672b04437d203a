//! Association reports pushed by joining nodes.

use crate::ProcedureError;
use hub_routing::MeshProtocol;
use hub_session::SessionManager;
use hub_topology::{fmt_node_id, rssi_to_weight, GraphError, NetworkHandle};
use hub_wire::{Associate, Command, Reply};
use tracing::{debug, info, warn};

/// Add the reporting node and its best neighbours to the graph.
///
/// Every listed neighbour gets an edge to the reporting node in both
/// directions, weighted from the reported RSSI. Returns the number of edges
/// updated.
pub async fn apply_associate(
    network: &NetworkHandle,
    report: &Associate,
) -> Result<usize, GraphError> {
    network
        .update(|net| {
            net.add_node(report.source);
            let mut updated = 0;
            for (neighbour, rssi) in report.node_id.iter().zip(report.rssi) {
                if *neighbour == 0 || *neighbour == report.source {
                    continue;
                }
                let weight = rssi_to_weight(rssi);
                net.change_edge_weight(*neighbour, report.source, weight, weight)?;
                debug!(
                    "Associate {} via {} rssi {}",
                    fmt_node_id(report.source),
                    fmt_node_id(*neighbour),
                    rssi
                );
                updated += 1;
            }
            Ok(updated)
        })
        .await
}

/// Applies association reports and checks the new node answers
#[derive(Debug, Clone)]
pub struct AssociateHandler {
    session: SessionManager,
    network: NetworkHandle,
}

impl AssociateHandler {
    /// Create a handler for the live network
    pub fn new(session: SessionManager, network: NetworkHandle) -> Self {
        Self { session, network }
    }

    /// Fold `report` into the graph, then query the node id of the source
    pub async fn handle(&self, report: Associate) -> Result<(), ProcedureError> {
        info!(
            "Node {} associated to server {}",
            fmt_node_id(report.source),
            fmt_node_id(report.server)
        );
        let updated = apply_associate(&self.network, &report).await?;
        if updated == 0 {
            warn!(
                "Associate from {} listed no neighbours",
                fmt_node_id(report.source)
            );
            return Ok(());
        }

        match self
            .session
            .send_receive(&Command::NodeId, MeshProtocol::Auto, report.source)
            .await?
        {
            Reply::NodeId(id) if id == report.source => {
                debug!("Node {} answered after association", fmt_node_id(id));
                Ok(())
            }
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}
