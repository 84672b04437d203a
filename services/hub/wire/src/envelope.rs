//! Routing envelopes wrapping an inner frame for delivery beyond the coordinator.

use crate::codec::FieldReader;
use crate::frame::{MULTIPATH_HEADER_LEN, UNICAST_HEADER_LEN};
use crate::opcode::Opcode;
use crate::{ApiFrame, MeshNodeId, WireError};
use bytes::{BufMut, Bytes, BytesMut};

/// Outgoing frame as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Handled by the coordinator itself
    Direct(Bytes),
    /// Delivered to a neighbour of the coordinator
    Unicast {
        /// Destination node
        target: MeshNodeId,
        /// Inner payload
        inner: Bytes,
    },
    /// Source routed through intermediate hops
    Multipath {
        /// Destination node
        target: MeshNodeId,
        /// Intermediate hops (both endpoints excluded)
        path: Vec<MeshNodeId>,
        /// Inner payload
        inner: Bytes,
    },
}

impl Envelope {
    /// Inner payload regardless of envelope kind
    pub fn inner(&self) -> &Bytes {
        match self {
            Envelope::Direct(inner)
            | Envelope::Unicast { inner, .. }
            | Envelope::Multipath { inner, .. } => inner,
        }
    }

    /// Build the frame for this envelope
    pub fn to_frame(&self) -> Result<ApiFrame, WireError> {
        match self {
            Envelope::Direct(inner) => ApiFrame::new(inner.clone()),
            Envelope::Unicast { target, inner } => {
                let mut buf = BytesMut::with_capacity(UNICAST_HEADER_LEN + inner.len());
                buf.put_u8(Opcode::Unicast as u8);
                buf.put_u32_le(*target);
                buf.put_slice(inner);
                ApiFrame::new(buf.freeze())
            }
            Envelope::Multipath {
                target,
                path,
                inner,
            } => {
                let hops = u8::try_from(path.len())
                    .map_err(|_| WireError::Encoding(format!("path of {} hops", path.len())))?;
                let mut buf =
                    BytesMut::with_capacity(MULTIPATH_HEADER_LEN + 4 * path.len() + inner.len());
                buf.put_u8(Opcode::Multipath as u8);
                buf.put_u32_le(*target);
                buf.put_u8(hops);
                for hop in path {
                    buf.put_u32_le(*hop);
                }
                buf.put_slice(inner);
                ApiFrame::new(buf.freeze())
            }
        }
    }

    /// Split a frame into envelope and inner payload
    pub fn parse(frame: &ApiFrame) -> Result<Self, WireError> {
        let payload = frame.payload();
        match Opcode::try_from(frame.opcode()) {
            Ok(Opcode::Unicast) => {
                let mut r = FieldReader::new(payload, 1);
                let target = r.u32()?;
                Ok(Envelope::Unicast {
                    target,
                    inner: payload.slice(UNICAST_HEADER_LEN..),
                })
            }
            Ok(Opcode::Multipath) => {
                let mut r = FieldReader::new(payload, 1);
                let target = r.u32()?;
                let hops = r.u8()?;
                let path = (0..hops).map(|_| r.u32()).collect::<Result<Vec<_>, _>>()?;
                let offset = MULTIPATH_HEADER_LEN + 4 * path.len();
                Ok(Envelope::Multipath {
                    target,
                    path,
                    inner: payload.slice(offset..),
                })
            }
            _ => Ok(Envelope::Direct(payload.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;

    #[test]
    fn test_unicast_layout() {
        let inner = Command::NodeId.encode().unwrap();
        let frame = Envelope::Unicast {
            target: 0x00ABCDEF,
            inner,
        }
        .to_frame()
        .unwrap();
        assert_eq!(frame.payload().as_ref(), &[114, 0xEF, 0xCD, 0xAB, 0x00, 4]);
    }

    #[test]
    fn test_multipath_parse() {
        let env = Envelope::Multipath {
            target: 3,
            path: vec![1, 2],
            inner: Command::FirmRev.encode().unwrap(),
        };
        let frame = env.to_frame().unwrap();
        assert_eq!(frame.payload().len(), MULTIPATH_HEADER_LEN + 8 + 1);
        assert_eq!(Envelope::parse(&frame).unwrap(), env);
    }

    #[test]
    fn test_direct_passthrough() {
        let frame = Command::Reboot.to_frame().unwrap();
        let env = Envelope::parse(&frame).unwrap();
        assert_eq!(env, Envelope::Direct(frame.payload().clone()));
    }
}
