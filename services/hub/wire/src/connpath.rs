//! Connected-path records used by the virtual circuit protocol.
//!
//! Request layout (opcode 122):
//!
//! ```text
//! +--------+----------+---------+------------+--------------+--------------+---------------+------+
//! | opcode | protocol | command | handle u16 | reserved u16 | sequence u16 | data_size u16 | data |
//! +--------+----------+---------+------------+--------------+--------------+---------------+------+
//! ```
//!
//! Reply layout (opcode 123): `opcode, command, handle u16, data`.

use crate::codec::FieldReader;
use crate::opcode::Opcode;
use crate::{MeshNodeId, WireError};
use bytes::{BufMut, Bytes, BytesMut};

/// Protocol byte selecting the node API port handler
pub const CONNECTED_PATH_PROTOCOL: u8 = 7;

/// Fixed header size of a connected-path request
pub const CONNECTED_PATH_HEADER_LEN: usize = 11;

/// Connected-path command byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectedPathCommand {
    /// Open a circuit towards a node port
    Open = 1,
    /// Remote side does not know the handle
    InvalidHandle = 4,
    /// Circuit payload
    SendData = 5,
    /// Open accepted
    OpenAck = 6,
    /// Open refused
    OpenNack = 7,
    /// Tear down a circuit
    Disconnect = 8,
    /// Payload could not be delivered
    SendDataNack = 9,
    /// Reset every circuit on the remote side
    ClearConnections = 10,
}

impl TryFrom<u8> for ConnectedPathCommand {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConnectedPathCommand::Open),
            4 => Ok(ConnectedPathCommand::InvalidHandle),
            5 => Ok(ConnectedPathCommand::SendData),
            6 => Ok(ConnectedPathCommand::OpenAck),
            7 => Ok(ConnectedPathCommand::OpenNack),
            8 => Ok(ConnectedPathCommand::Disconnect),
            9 => Ok(ConnectedPathCommand::SendDataNack),
            10 => Ok(ConnectedPathCommand::ClearConnections),
            _ => Err(WireError::UnknownSubType {
                opcode: Opcode::ConnectedPathRequest as u8,
                sub: value,
            }),
        }
    }
}

/// Body of an Open command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTarget {
    /// Destination TCP-like port on the node
    pub port: u16,
    /// Hops after the local node, target last
    pub path: Vec<MeshNodeId>,
}

impl OpenTarget {
    fn encode(&self) -> Result<Bytes, WireError> {
        let hops = u8::try_from(self.path.len())
            .map_err(|_| WireError::Encoding(format!("path of {} hops", self.path.len())))?;
        let mut buf = BytesMut::with_capacity(3 + 4 * self.path.len());
        buf.put_u16_le(self.port);
        buf.put_u8(hops);
        for hop in &self.path {
            buf.put_u32_le(*hop);
        }
        Ok(buf.freeze())
    }

    /// Parse the data section of an Open request
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = FieldReader::new(data, 0);
        let port = r.u16()?;
        let hops = r.u8()?;
        let path = (0..hops).map(|_| r.u32()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { port, path })
    }
}

/// Connected-path request (hub to mesh)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPathRequest {
    /// Command
    pub command: ConnectedPathCommand,
    /// Circuit handle (0 is reserved for ClearConnections)
    pub handle: u16,
    /// Per circuit sequence number
    pub sequence: u16,
    /// Command data
    pub data: Bytes,
}

impl ConnectedPathRequest {
    /// Open request carrying the port and hop list
    pub fn open(handle: u16, sequence: u16, target: &OpenTarget) -> Result<Self, WireError> {
        Ok(Self {
            command: ConnectedPathCommand::Open,
            handle,
            sequence,
            data: target.encode()?,
        })
    }

    /// Data chunk for an active circuit
    pub fn send_data(handle: u16, sequence: u16, data: Bytes) -> Self {
        Self {
            command: ConnectedPathCommand::SendData,
            handle,
            sequence,
            data,
        }
    }

    /// Explicit teardown
    pub fn disconnect(handle: u16, sequence: u16) -> Self {
        Self {
            command: ConnectedPathCommand::Disconnect,
            handle,
            sequence,
            data: Bytes::new(),
        }
    }

    /// Tell the node a handle is unknown here
    pub fn invalid_handle(handle: u16) -> Self {
        Self {
            command: ConnectedPathCommand::InvalidHandle,
            handle,
            sequence: 0,
            data: Bytes::new(),
        }
    }

    /// Reset all remote circuits (reserved handle 0)
    pub fn clear_connections() -> Self {
        Self {
            command: ConnectedPathCommand::ClearConnections,
            handle: 0,
            sequence: 0,
            data: Bytes::new(),
        }
    }

    /// Parse the Open body when this is an Open request
    pub fn open_target(&self) -> Option<Result<OpenTarget, WireError>> {
        (self.command == ConnectedPathCommand::Open).then(|| OpenTarget::decode(&self.data))
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let size = u16::try_from(self.data.len())
            .map_err(|_| WireError::Encoding(format!("data of {} bytes", self.data.len())))?;
        buf.put_u8(Opcode::ConnectedPathRequest as u8);
        buf.put_u8(CONNECTED_PATH_PROTOCOL);
        buf.put_u8(self.command as u8);
        buf.put_u16_le(self.handle);
        buf.put_u16_le(0);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(size);
        buf.put_slice(&self.data);
        Ok(())
    }

    pub(crate) fn decode_from(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = FieldReader::new(payload, 1);
        let protocol = r.u8()?;
        if protocol != CONNECTED_PATH_PROTOCOL {
            return Err(WireError::Malformed("unexpected connected-path protocol"));
        }
        let command = ConnectedPathCommand::try_from(r.u8()?)?;
        let handle = r.u16()?;
        let _reserved = r.u16()?;
        let sequence = r.u16()?;
        let size = r.u16()? as usize;
        let data = Bytes::copy_from_slice(r.bytes(size)?);
        Ok(Self {
            command,
            handle,
            sequence,
            data,
        })
    }
}

/// Connected-path reply (mesh to hub)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPathReply {
    /// Command
    pub command: ConnectedPathCommand,
    /// Circuit handle
    pub handle: u16,
    /// Payload for SendData
    pub data: Bytes,
}

impl ConnectedPathReply {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(Opcode::ConnectedPathReply as u8);
        buf.put_u8(self.command as u8);
        buf.put_u16_le(self.handle);
        buf.put_slice(&self.data);
    }

    pub(crate) fn decode_from(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = FieldReader::new(payload, 1);
        let command = ConnectedPathCommand::try_from(r.u8()?)?;
        let handle = r.u16()?;
        let data = Bytes::copy_from_slice(r.rest());
        Ok(Self {
            command,
            handle,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_layout() {
        let target = OpenTarget {
            port: 6053,
            path: vec![0x000102, 0x0A0B0C],
        };
        let req = ConnectedPathRequest::open(3, 1, &target).unwrap();
        let mut buf = BytesMut::new();
        req.encode_into(&mut buf).unwrap();

        assert_eq!(buf[0], 122);
        assert_eq!(buf[1], CONNECTED_PATH_PROTOCOL);
        assert_eq!(buf[2], ConnectedPathCommand::Open as u8);
        assert_eq!(&buf[3..5], &3u16.to_le_bytes());
        assert_eq!(&buf[5..7], &[0, 0]);
        assert_eq!(&buf[7..9], &1u16.to_le_bytes());
        // data_size = hops * 4 + 3
        assert_eq!(&buf[9..11], &11u16.to_le_bytes());
        assert_eq!(&buf[11..13], &6053u16.to_le_bytes());
        assert_eq!(buf[13], 2);
        assert_eq!(buf.len(), CONNECTED_PATH_HEADER_LEN + 11);

        let decoded = ConnectedPathRequest::decode_from(&buf).unwrap();
        assert_eq!(decoded.open_target().unwrap().unwrap(), target);
    }

    #[test]
    fn test_clear_connections_uses_handle_zero() {
        let req = ConnectedPathRequest::clear_connections();
        let mut buf = BytesMut::new();
        req.encode_into(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[122, 7, 10, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_reply_data_starts_at_offset_four() {
        let payload = [123, 5, 0x34, 0x12, b'a', b'b'];
        let reply = ConnectedPathReply::decode_from(&payload).unwrap();
        assert_eq!(reply.command, ConnectedPathCommand::SendData);
        assert_eq!(reply.handle, 0x1234);
        assert_eq!(reply.data.as_ref(), b"ab");
    }

    #[test]
    fn test_unknown_command() {
        let payload = [123, 2, 0x01, 0x00];
        assert!(matches!(
            ConnectedPathReply::decode_from(&payload),
            Err(WireError::UnknownSubType { sub: 2, .. })
        ));
    }
}
