//! Typed replies and push frames received from mesh nodes.

use crate::codec::{finish, fixed_str, put_fixed_str, FieldReader};
use crate::connpath::ConnectedPathReply;
use crate::opcode::Opcode;
use crate::{ApiFrame, MeshNodeId, WireError};
use bytes::{BufMut, Bytes, BytesMut};

/// Width of the tag field in a NodeConfig reply
pub const NODE_CONFIG_TAG_WIDTH: usize = 32;

/// Discovery sub-opcode of the unsolicited associate frame
pub const DISCOVERY_ASSOCIATE: u8 = 0x0B;

/// Node configuration block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Free text tag
    pub tag: String,
    /// Log destination node
    pub log_dest: u32,
    /// Radio channel
    pub channel: u8,
    /// Transmit power
    pub tx_power: u8,
    /// Group bitmap
    pub groups: u32,
    /// Bound server node
    pub binded_server: u32,
    /// Node flags
    pub flags: u8,
}

/// One row of a node's neighbour table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryTableItem {
    /// Row index
    pub index: u8,
    /// Neighbour node id
    pub node_id: MeshNodeId,
    /// RSSI measured by the queried node
    pub rssi1: i16,
    /// RSSI measured by the neighbour
    pub rssi2: i16,
    /// Row flags
    pub flags: u16,
}

/// Unsolicited association report from a joining node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Associate {
    /// Reporting node
    pub source: MeshNodeId,
    /// Server the node is bound to
    pub server: MeshNodeId,
    /// RSSI of the best neighbours
    pub rssi: [i16; 3],
    /// Best neighbours (0 when unused)
    pub node_id: [MeshNodeId; 3],
}

/// Discovery group replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryReply {
    /// Table cleared
    ResetTable,
    /// Number of rows
    TableSize(u8),
    /// One row
    TableItem(DiscoveryTableItem),
    /// Scan started
    StartDiscover,
    /// Association report (push)
    Associate(Associate),
}

impl DiscoveryReply {
    /// Sub-opcode of this reply
    pub fn sub_opcode(&self) -> u8 {
        match self {
            DiscoveryReply::ResetTable => 0x01,
            DiscoveryReply::TableSize(_) => 0x03,
            DiscoveryReply::TableItem(_) => 0x05,
            DiscoveryReply::StartDiscover => 0x07,
            DiscoveryReply::Associate(_) => DISCOVERY_ASSOCIATE,
        }
    }
}

/// Flash group replies (sub-opcode echoes the request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashReply {
    /// Region digest
    GetMd5 {
        /// Region reads as erased
        erased: bool,
        /// MD5 digest
        md5: [u8; 16],
    },
    /// Erase result
    Erase {
        /// Result code (0 is success)
        result: u8,
    },
    /// Write result
    Write {
        /// True when written
        result: bool,
    },
    /// Boot accepted
    EBoot,
}

impl FlashReply {
    /// Sub-opcode of this reply
    pub fn sub_opcode(&self) -> u8 {
        match self {
            FlashReply::GetMd5 { .. } => 1,
            FlashReply::Erase { .. } => 2,
            FlashReply::Write { .. } => 3,
            FlashReply::EBoot => 4,
        }
    }
}

/// Log line pushed by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Severity as reported by the node
    pub level: u16,
    /// Originating node
    pub from: MeshNodeId,
    /// Text
    pub line: String,
}

/// Replies and push frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Echoed text
    Echo(String),
    /// Firmware revision string
    FirmRev(String),
    /// Node id
    NodeId(MeshNodeId),
    /// Tag stored
    SetTag,
    /// Bound server cleared
    BindClear,
    /// Channel changed
    SetChannel,
    /// Node configuration
    NodeConfig(NodeConfig),
    /// Reboot accepted
    Reboot,
    /// Discovery group
    Discovery(DiscoveryReply),
    /// Flash group
    Flash(FlashReply),
    /// Entity counters per service
    EntitiesCount([u8; 6]),
    /// Entity hash
    EntityHash {
        /// Hash
        hash: u16,
        /// Description
        info: String,
    },
    /// Entity state
    GetEntityState {
        /// State value
        state: u16,
    },
    /// Entity state written
    SetEntityState,
    /// Log line (push)
    LogEvent(LogEvent),
    /// Virtual circuit traffic (push)
    ConnectedPath(ConnectedPathReply),
}

impl Reply {
    /// Opcode of this reply
    pub fn opcode(&self) -> Opcode {
        match self {
            Reply::Echo(_) => Opcode::EchoReply,
            Reply::FirmRev(_) => Opcode::FirmRevReply,
            Reply::NodeId(_) => Opcode::NodeIdReply,
            Reply::SetTag => Opcode::SetTagReply,
            Reply::BindClear => Opcode::BindClearReply,
            Reply::SetChannel => Opcode::SetChannelReply,
            Reply::NodeConfig(_) => Opcode::NodeConfigReply,
            Reply::Reboot => Opcode::RebootReply,
            Reply::Discovery(_) => Opcode::DiscoveryReply,
            Reply::Flash(_) => Opcode::FlashReply,
            Reply::EntitiesCount(_) => Opcode::EntitiesCountReply,
            Reply::EntityHash { .. } => Opcode::EntityHashReply,
            Reply::GetEntityState { .. } => Opcode::GetEntityStateReply,
            Reply::SetEntityState => Opcode::SetEntityStateReply,
            Reply::LogEvent(_) => Opcode::LogEvent,
            Reply::ConnectedPath(_) => Opcode::ConnectedPathReply,
        }
    }

    /// Decode an unescaped reply payload
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let first = *payload.first().ok_or(WireError::Truncated { need: 1, got: 0 })?;
        let mut r = FieldReader::new(payload, 1);

        let reply = match Opcode::try_from(first)? {
            Opcode::EchoReply => Reply::Echo(r.rest_string()),
            Opcode::FirmRevReply => Reply::FirmRev(r.rest_string()),
            Opcode::NodeIdReply => Reply::NodeId(r.u32()?),
            Opcode::SetTagReply => Reply::SetTag,
            Opcode::BindClearReply => Reply::BindClear,
            Opcode::SetChannelReply => Reply::SetChannel,
            Opcode::NodeConfigReply => Reply::NodeConfig(NodeConfig {
                tag: fixed_str(r.bytes(NODE_CONFIG_TAG_WIDTH)?),
                log_dest: r.u32()?,
                channel: r.u8()?,
                tx_power: r.u8()?,
                groups: r.u32()?,
                binded_server: r.u32()?,
                flags: r.u8()?,
            }),
            Opcode::RebootReply => Reply::Reboot,
            Opcode::DiscoveryReply => {
                let sub = r.u8()?;
                Reply::Discovery(match sub {
                    0x01 => DiscoveryReply::ResetTable,
                    0x03 => DiscoveryReply::TableSize(r.u8()?),
                    0x05 => DiscoveryReply::TableItem(DiscoveryTableItem {
                        index: r.u8()?,
                        node_id: r.u32()?,
                        rssi1: r.i16()?,
                        rssi2: r.i16()?,
                        flags: r.u16()?,
                    }),
                    0x07 => DiscoveryReply::StartDiscover,
                    DISCOVERY_ASSOCIATE => DiscoveryReply::Associate(Associate {
                        source: r.u32()?,
                        server: r.u32()?,
                        rssi: [r.i16()?, r.i16()?, r.i16()?],
                        node_id: [r.u32()?, r.u32()?, r.u32()?],
                    }),
                    _ => {
                        return Err(WireError::UnknownSubType {
                            opcode: first,
                            sub,
                        })
                    }
                })
            }
            Opcode::FlashReply => {
                let sub = r.u8()?;
                Reply::Flash(match sub {
                    1 => FlashReply::GetMd5 {
                        erased: r.bool()?,
                        md5: r.array::<16>()?,
                    },
                    2 => FlashReply::Erase { result: r.u8()? },
                    3 => FlashReply::Write { result: r.bool()? },
                    4 => FlashReply::EBoot,
                    _ => {
                        return Err(WireError::UnknownSubType {
                            opcode: first,
                            sub,
                        })
                    }
                })
            }
            Opcode::EntitiesCountReply => Reply::EntitiesCount(r.array::<6>()?),
            Opcode::EntityHashReply => Reply::EntityHash {
                hash: r.u16()?,
                info: r.rest_string(),
            },
            Opcode::GetEntityStateReply => Reply::GetEntityState { state: r.u16()? },
            Opcode::SetEntityStateReply => Reply::SetEntityState,
            Opcode::LogEvent => Reply::LogEvent(LogEvent {
                level: r.u16()?,
                from: r.u32()?,
                line: r.rest_string(),
            }),
            Opcode::ConnectedPathReply => {
                Reply::ConnectedPath(ConnectedPathReply::decode_from(payload)?)
            }
            _ => return Err(WireError::UnknownFrameType(first)),
        };

        Ok(reply)
    }

    /// Decode a received frame
    pub fn from_frame(frame: &ApiFrame) -> Result<Self, WireError> {
        Self::decode(frame.payload())
    }

    /// Encode to an unescaped payload (used by node simulators and tests)
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.opcode() as u8);

        match self {
            Reply::Echo(text) | Reply::FirmRev(text) => buf.put_slice(text.as_bytes()),
            Reply::NodeId(id) => buf.put_u32_le(*id),
            Reply::NodeConfig(cfg) => {
                put_fixed_str(&mut buf, &cfg.tag, NODE_CONFIG_TAG_WIDTH)?;
                buf.put_u32_le(cfg.log_dest);
                buf.put_u8(cfg.channel);
                buf.put_u8(cfg.tx_power);
                buf.put_u32_le(cfg.groups);
                buf.put_u32_le(cfg.binded_server);
                buf.put_u8(cfg.flags);
            }
            Reply::Discovery(reply) => {
                buf.put_u8(reply.sub_opcode());
                match reply {
                    DiscoveryReply::TableSize(size) => buf.put_u8(*size),
                    DiscoveryReply::TableItem(item) => {
                        buf.put_u8(item.index);
                        buf.put_u32_le(item.node_id);
                        buf.put_i16_le(item.rssi1);
                        buf.put_i16_le(item.rssi2);
                        buf.put_u16_le(item.flags);
                    }
                    DiscoveryReply::Associate(assoc) => {
                        buf.put_u32_le(assoc.source);
                        buf.put_u32_le(assoc.server);
                        for rssi in assoc.rssi {
                            buf.put_i16_le(rssi);
                        }
                        for id in assoc.node_id {
                            buf.put_u32_le(id);
                        }
                    }
                    DiscoveryReply::ResetTable | DiscoveryReply::StartDiscover => {}
                }
            }
            Reply::Flash(reply) => {
                buf.put_u8(reply.sub_opcode());
                match reply {
                    FlashReply::GetMd5 { erased, md5 } => {
                        buf.put_u8(*erased as u8);
                        buf.put_slice(md5);
                    }
                    FlashReply::Erase { result } => buf.put_u8(*result),
                    FlashReply::Write { result } => buf.put_u8(*result as u8),
                    FlashReply::EBoot => {}
                }
            }
            Reply::EntitiesCount(counters) => buf.put_slice(counters),
            Reply::EntityHash { hash, info } => {
                buf.put_u16_le(*hash);
                buf.put_slice(info.as_bytes());
            }
            Reply::GetEntityState { state } => buf.put_u16_le(*state),
            Reply::LogEvent(event) => {
                buf.put_u16_le(event.level);
                buf.put_u32_le(event.from);
                buf.put_slice(event.line.as_bytes());
            }
            Reply::ConnectedPath(reply) => {
                buf.clear();
                reply.encode_into(&mut buf);
            }
            Reply::SetTag
            | Reply::BindClear
            | Reply::SetChannel
            | Reply::Reboot
            | Reply::SetEntityState => {}
        }

        finish(buf)
    }

    /// Encode as a frame
    pub fn to_frame(&self) -> Result<ApiFrame, WireError> {
        ApiFrame::new(self.encode()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connpath::ConnectedPathCommand;
    use crate::{Command, DiscoveryCommand, FlashCommand};

    #[test]
    fn test_node_id_reply() {
        let reply = Reply::decode(&[5, 0x56, 0x34, 0x12, 0x00]).unwrap();
        assert_eq!(reply, Reply::NodeId(0x123456));
    }

    #[test]
    fn test_table_item_layout() {
        let payload = [27, 5, 2, 0x03, 0x02, 0x01, 0x00, 0xF6, 0xFF, 0x05, 0x00, 0x00, 0x00];
        let reply = Reply::decode(&payload).unwrap();
        assert_eq!(
            reply,
            Reply::Discovery(DiscoveryReply::TableItem(DiscoveryTableItem {
                index: 2,
                node_id: 0x010203,
                rssi1: -10,
                rssi2: 5,
                flags: 0,
            }))
        );
        assert_eq!(reply.encode().unwrap().as_ref(), &payload);
    }

    #[test]
    fn test_log_event_line_from_byte_seven() {
        let mut payload = vec![57, 0x02, 0x00, 0x44, 0x33, 0x22, 0x00];
        payload.extend_from_slice(b"boot ok");
        let reply = Reply::decode(&payload).unwrap();
        assert_eq!(
            reply,
            Reply::LogEvent(LogEvent {
                level: 2,
                from: 0x223344,
                line: "boot ok".into()
            })
        );
    }

    #[test]
    fn test_reply_matches_its_request() {
        let requests = [
            Command::Echo("x".into()),
            Command::NodeId,
            Command::Discovery(DiscoveryCommand::TableItem { index: 0 }),
            Command::Flash(FlashCommand::Erase {
                address: 0,
                length: 4096,
            }),
            Command::Flash(FlashCommand::Write {
                address: 0,
                data: Bytes::from_static(b"abc"),
            }),
        ];
        let replies = [
            Reply::Echo("x".into()),
            Reply::NodeId(1),
            Reply::Discovery(DiscoveryReply::TableItem(DiscoveryTableItem {
                index: 0,
                node_id: 1,
                rssi1: 0,
                rssi2: 0,
                flags: 0,
            })),
            Reply::Flash(FlashReply::Erase { result: 0 }),
            Reply::Flash(FlashReply::Write { result: true }),
        ];
        for (cmd, reply) in requests.iter().zip(replies.iter()) {
            let awaited = cmd.to_frame().unwrap().awaited_reply().unwrap().unwrap();
            assert!(reply.to_frame().unwrap().is_reply_to(&awaited), "{:?}", cmd);
        }
    }

    #[test]
    fn test_connected_path_reply() {
        let reply = Reply::ConnectedPath(ConnectedPathReply {
            command: ConnectedPathCommand::OpenAck,
            handle: 9,
            data: Bytes::new(),
        });
        let encoded = reply.encode().unwrap();
        assert_eq!(encoded.as_ref(), &[123, 6, 9, 0]);
        assert_eq!(Reply::decode(&encoded).unwrap(), reply);
    }

    #[test]
    fn test_truncated_reply() {
        assert!(matches!(
            Reply::decode(&[5, 1, 2]),
            Err(WireError::Truncated { need: 5, got: 3 })
        ));
    }
}
