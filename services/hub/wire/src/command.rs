//! Typed requests sent from the hub to mesh nodes.

use crate::codec::{finish, fixed_str, put_fixed_str, FieldReader};
use crate::connpath::ConnectedPathRequest;
use crate::opcode::Opcode;
use crate::{ApiFrame, WireError};
use bytes::{BufMut, Bytes, BytesMut};

/// Width of the tag field in a SetTag request
pub const SET_TAG_WIDTH: usize = 31;

/// Default slot count for StartDiscover
pub const DEFAULT_SLOT_NUM: u8 = 100;

/// Discovery group requests (sub-opcode at payload[1])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryCommand {
    /// Clear the neighbour table
    ResetTable,
    /// Read the neighbour table size
    TableSize,
    /// Read one neighbour table row
    TableItem {
        /// Row index
        index: u8,
    },
    /// Start a neighbour scan
    StartDiscover {
        /// Node mask
        mask: u8,
        /// Node filter
        filter: u8,
        /// Slot count
        slot_num: u8,
    },
}

impl DiscoveryCommand {
    /// Sub-opcode of this request
    pub fn sub_opcode(&self) -> u8 {
        match self {
            DiscoveryCommand::ResetTable => 0x00,
            DiscoveryCommand::TableSize => 0x02,
            DiscoveryCommand::TableItem { .. } => 0x04,
            DiscoveryCommand::StartDiscover { .. } => 0x06,
        }
    }

    /// Scan with default parameters
    pub fn start_default() -> Self {
        DiscoveryCommand::StartDiscover {
            mask: 0,
            filter: 0,
            slot_num: DEFAULT_SLOT_NUM,
        }
    }
}

/// Flash group requests (sub-opcode at payload[1])
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashCommand {
    /// MD5 of a flash region
    GetMd5 {
        /// Start address
        address: u32,
        /// Region length
        length: u32,
    },
    /// Erase a flash region
    Erase {
        /// Start address
        address: u32,
        /// Region length
        length: u32,
    },
    /// Write a chunk
    Write {
        /// Start address
        address: u32,
        /// Chunk bytes
        data: Bytes,
    },
    /// Boot the image at address
    EBoot {
        /// Image address
        address: u32,
        /// Image length
        length: u32,
    },
}

impl FlashCommand {
    /// Sub-opcode of this request
    pub fn sub_opcode(&self) -> u8 {
        match self {
            FlashCommand::GetMd5 { .. } => 1,
            FlashCommand::Erase { .. } => 2,
            FlashCommand::Write { .. } => 3,
            FlashCommand::EBoot { .. } => 4,
        }
    }
}

/// Requests understood by mesh nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Echo text back
    Echo(String),
    /// Firmware revision
    FirmRev,
    /// Node id of the addressed node
    NodeId,
    /// Store a free text tag (up to 31 bytes)
    SetTag(String),
    /// Clear the bound server
    BindClear,
    /// Change the radio channel
    SetChannel(u8),
    /// Read the node configuration
    NodeConfig,
    /// Reboot the node
    Reboot,
    /// Discovery group
    Discovery(DiscoveryCommand),
    /// Flash group
    Flash(FlashCommand),
    /// Entity counters per service
    EntitiesCount,
    /// Hash of an entity
    EntityHash {
        /// Service id
        service: u8,
        /// Entity index
        index: u8,
    },
    /// Read entity state
    GetEntityState {
        /// Service id
        service: u8,
        /// Entity hash
        hash: u16,
    },
    /// Write entity state
    SetEntityState {
        /// Service id
        service: u8,
        /// Entity hash
        hash: u16,
        /// New state
        state: u16,
    },
    /// Virtual circuit traffic
    ConnectedPath(ConnectedPathRequest),
}

impl Command {
    /// Opcode of this request
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Echo(_) => Opcode::EchoRequest,
            Command::FirmRev => Opcode::FirmRevRequest,
            Command::NodeId => Opcode::NodeIdRequest,
            Command::SetTag(_) => Opcode::SetTagRequest,
            Command::BindClear => Opcode::BindClearRequest,
            Command::SetChannel(_) => Opcode::SetChannelRequest,
            Command::NodeConfig => Opcode::NodeConfigRequest,
            Command::Reboot => Opcode::RebootRequest,
            Command::Discovery(_) => Opcode::DiscoveryRequest,
            Command::Flash(_) => Opcode::FlashRequest,
            Command::EntitiesCount => Opcode::EntitiesCountRequest,
            Command::EntityHash { .. } => Opcode::EntityHashRequest,
            Command::GetEntityState { .. } => Opcode::GetEntityStateRequest,
            Command::SetEntityState { .. } => Opcode::SetEntityStateRequest,
            Command::ConnectedPath(_) => Opcode::ConnectedPathRequest,
        }
    }

    /// True when the node answers this request
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Command::ConnectedPath(_))
    }

    /// Encode to an unescaped payload
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.opcode() as u8);

        match self {
            Command::Echo(text) => buf.put_slice(text.as_bytes()),
            Command::SetTag(tag) => put_fixed_str(&mut buf, tag, SET_TAG_WIDTH)?,
            Command::SetChannel(channel) => buf.put_u8(*channel),
            Command::Discovery(cmd) => {
                buf.put_u8(cmd.sub_opcode());
                match *cmd {
                    DiscoveryCommand::TableItem { index } => buf.put_u8(index),
                    DiscoveryCommand::StartDiscover {
                        mask,
                        filter,
                        slot_num,
                    } => {
                        buf.put_u8(mask);
                        buf.put_u8(filter);
                        buf.put_u8(slot_num);
                    }
                    DiscoveryCommand::ResetTable | DiscoveryCommand::TableSize => {}
                }
            }
            Command::Flash(cmd) => {
                buf.put_u8(cmd.sub_opcode());
                match cmd {
                    FlashCommand::GetMd5 { address, length }
                    | FlashCommand::Erase { address, length }
                    | FlashCommand::EBoot { address, length } => {
                        buf.put_u32_le(*address);
                        buf.put_u32_le(*length);
                    }
                    FlashCommand::Write { address, data } => {
                        buf.put_u32_le(*address);
                        buf.put_slice(data);
                    }
                }
            }
            Command::EntityHash { service, index } => {
                buf.put_u8(*service);
                buf.put_u8(*index);
            }
            Command::GetEntityState { service, hash } => {
                buf.put_u8(*service);
                buf.put_u16_le(*hash);
            }
            Command::SetEntityState {
                service,
                hash,
                state,
            } => {
                buf.put_u8(*service);
                buf.put_u16_le(*hash);
                buf.put_u16_le(*state);
            }
            Command::ConnectedPath(req) => {
                buf.clear();
                req.encode_into(&mut buf)?;
            }
            Command::FirmRev
            | Command::NodeId
            | Command::BindClear
            | Command::NodeConfig
            | Command::Reboot
            | Command::EntitiesCount => {}
        }

        finish(buf)
    }

    /// Encode as a direct (unwrapped) frame
    pub fn to_frame(&self) -> Result<ApiFrame, WireError> {
        ApiFrame::new(self.encode()?)
    }

    /// Decode an unescaped request payload
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let first = *payload.first().ok_or(WireError::Truncated { need: 1, got: 0 })?;
        let mut r = FieldReader::new(payload, 1);

        let cmd = match Opcode::try_from(first)? {
            Opcode::EchoRequest => Command::Echo(r.rest_string()),
            Opcode::FirmRevRequest => Command::FirmRev,
            Opcode::NodeIdRequest => Command::NodeId,
            Opcode::SetTagRequest => Command::SetTag(fixed_str(r.bytes(SET_TAG_WIDTH)?)),
            Opcode::BindClearRequest => Command::BindClear,
            Opcode::SetChannelRequest => Command::SetChannel(r.u8()?),
            Opcode::NodeConfigRequest => Command::NodeConfig,
            Opcode::RebootRequest => Command::Reboot,
            Opcode::DiscoveryRequest => {
                let sub = r.u8()?;
                Command::Discovery(match sub {
                    0x00 => DiscoveryCommand::ResetTable,
                    0x02 => DiscoveryCommand::TableSize,
                    0x04 => DiscoveryCommand::TableItem { index: r.u8()? },
                    0x06 => DiscoveryCommand::StartDiscover {
                        mask: r.u8()?,
                        filter: r.u8()?,
                        slot_num: r.u8()?,
                    },
                    _ => {
                        return Err(WireError::UnknownSubType {
                            opcode: first,
                            sub,
                        })
                    }
                })
            }
            Opcode::FlashRequest => {
                let sub = r.u8()?;
                Command::Flash(match sub {
                    1 => FlashCommand::GetMd5 {
                        address: r.u32()?,
                        length: r.u32()?,
                    },
                    2 => FlashCommand::Erase {
                        address: r.u32()?,
                        length: r.u32()?,
                    },
                    3 => FlashCommand::Write {
                        address: r.u32()?,
                        data: Bytes::copy_from_slice(r.rest()),
                    },
                    4 => FlashCommand::EBoot {
                        address: r.u32()?,
                        length: r.u32()?,
                    },
                    _ => {
                        return Err(WireError::UnknownSubType {
                            opcode: first,
                            sub,
                        })
                    }
                })
            }
            Opcode::EntitiesCountRequest => Command::EntitiesCount,
            Opcode::EntityHashRequest => Command::EntityHash {
                service: r.u8()?,
                index: r.u8()?,
            },
            Opcode::GetEntityStateRequest => Command::GetEntityState {
                service: r.u8()?,
                hash: r.u16()?,
            },
            Opcode::SetEntityStateRequest => Command::SetEntityState {
                service: r.u8()?,
                hash: r.u16()?,
                state: r.u16()?,
            },
            Opcode::ConnectedPathRequest => {
                Command::ConnectedPath(ConnectedPathRequest::decode_from(payload)?)
            }
            _ => return Err(WireError::UnknownFrameType(first)),
        };

        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_layouts() {
        assert_eq!(Command::FirmRev.encode().unwrap().as_ref(), &[2]);
        assert_eq!(
            Command::Echo("CIAO".into()).encode().unwrap().as_ref(),
            b"\x00CIAO"
        );
        assert_eq!(
            Command::GetEntityState {
                service: 2,
                hash: 0xBEEF
            }
            .encode()
            .unwrap()
            .as_ref(),
            &[42, 2, 0xEF, 0xBE]
        );
        assert_eq!(
            Command::Discovery(DiscoveryCommand::start_default())
                .encode()
                .unwrap()
                .as_ref(),
            &[26, 6, 0, 0, 100]
        );
    }

    #[test]
    fn test_set_tag_fixed_width() {
        let encoded = Command::SetTag("lamp".into()).encode().unwrap();
        assert_eq!(encoded.len(), 1 + SET_TAG_WIDTH);
        assert_eq!(Command::decode(&encoded).unwrap(), Command::SetTag("lamp".into()));

        let long = Command::SetTag("t".repeat(40));
        assert!(matches!(long.encode(), Err(WireError::Encoding(_))));
    }

    #[test]
    fn test_flash_write_layout() {
        let cmd = Command::Flash(FlashCommand::Write {
            address: 0x1000,
            data: Bytes::from_static(&[9, 8, 7]),
        });
        let encoded = cmd.encode().unwrap();
        assert_eq!(encoded.as_ref(), &[30, 3, 0x00, 0x10, 0, 0, 9, 8, 7]);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn test_decode_unknown() {
        assert_eq!(
            Command::decode(&[100]).unwrap_err(),
            WireError::UnknownFrameType(100)
        );
        // Reply opcodes are not commands
        assert_eq!(
            Command::decode(&[1, b'x']).unwrap_err(),
            WireError::UnknownFrameType(1)
        );
        assert!(matches!(
            Command::decode(&[26, 9]),
            Err(WireError::UnknownSubType { opcode: 26, sub: 9 })
        ));
    }
}
