//! Node id formatting and parsing helpers.

use crate::GraphError;
use hub_wire::MeshNodeId;
use std::net::Ipv4Addr;

/// Mask of the 24-bit node address space
pub const NODE_ID_MASK: MeshNodeId = 0x00FF_FFFF;

/// Format a node id as `N` followed by six hex digits
pub fn fmt_node_id(id: MeshNodeId) -> String {
    format!("N{:06X}", id)
}

/// Format a path as `N000001 -> N000002 -> ...`
pub fn fmt_path(path: &[MeshNodeId]) -> String {
    path.iter()
        .map(|id| fmt_node_id(*id))
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Loopback address a node is published on (`127.b2.b1.b0`)
pub fn node_id_to_ip(id: MeshNodeId) -> Ipv4Addr {
    let [_, b2, b1, b0] = id.to_be_bytes();
    Ipv4Addr::new(127, b2, b1, b0)
}

/// Parse a node id.
///
/// Accepts dotted addresses (`0.18.52.86`, first octet ignored), `N123456`,
/// `0x123456` and plain decimal.
pub fn parse_node_id(text: &str) -> Result<MeshNodeId, GraphError> {
    let text = text.trim();
    let invalid = || GraphError::InvalidNodeId(text.to_string());

    let id = if text.contains('.') {
        let octets = text
            .split('.')
            .map(|part| part.parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        match octets.as_slice() {
            [_, b2, b1, b0] => u32::from_be_bytes([0, *b2, *b1, *b0]),
            _ => return Err(invalid()),
        }
    } else if let Some(hex) = text
        .strip_prefix('N')
        .or_else(|| text.strip_prefix("0x"))
        .or_else(|| text.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).map_err(|_| invalid())?
    } else {
        text.parse::<u32>().map_err(|_| invalid())?
    };

    if id > NODE_ID_MASK {
        return Err(invalid());
    }
    Ok(id)
}
