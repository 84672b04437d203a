//! Byte-stuffed framing for the coordinator serial link.
//!
//! A frame on the wire is `START escaped-payload STOP`. Any payload byte equal
//! to START, STOP or ESCAPE is prefixed with ESCAPE. [`ApiFrame`] always holds
//! the unescaped payload; escaping happens in [`ApiFrame::encode`] and is undone
//! by [`FrameDecoder`].

use crate::opcode::{awaited_reply, Opcode};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

/// Frame start delimiter
pub const START_BYTE: u8 = 0xFE;
/// Escape prefix
pub const ESCAPE_BYTE: u8 = 0xEA;
/// Frame stop delimiter
pub const STOP_BYTE: u8 = 0xEF;

/// Largest unescaped payload accepted by the decoder
pub const MAX_FRAME_SIZE: usize = 1500;

/// Length of the unicast envelope header (opcode + target)
pub const UNICAST_HEADER_LEN: usize = 5;
/// Length of the fixed part of the multipath envelope header (opcode + target + path_len)
pub const MULTIPATH_HEADER_LEN: usize = 6;

#[inline]
fn is_reserved(byte: u8) -> bool {
    matches!(byte, START_BYTE | ESCAPE_BYTE | STOP_BYTE)
}

/// Number of bytes that need an escape prefix
pub fn reserved_count(payload: &[u8]) -> usize {
    payload.iter().filter(|b| is_reserved(**b)).count()
}

/// Append the escaped form of `payload` to `out`
pub fn escape(payload: &[u8], out: &mut BytesMut) {
    out.reserve(payload.len() + reserved_count(payload));
    for &byte in payload {
        if is_reserved(byte) {
            out.put_u8(ESCAPE_BYTE);
        }
        out.put_u8(byte);
    }
}

/// Remove escape prefixes from an escaped payload (without delimiters)
pub fn unescape(escaped: &[u8]) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(escaped.len());
    let mut iter = escaped.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESCAPE_BYTE {
            match iter.next() {
                Some(&next) => out.put_u8(next),
                None => return Err(WireError::Malformed("dangling escape byte")),
            }
        } else {
            out.put_u8(byte);
        }
    }
    Ok(out.freeze())
}

/// Reply expected for an outgoing frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwaitedReply {
    /// Expected reply opcode
    pub opcode: u8,
    /// Expected sub-opcode at payload[1] for compound groups
    pub sub_opcode: Option<u8>,
}

impl AwaitedReply {
    /// Await a plain reply opcode
    pub fn plain(opcode: u8) -> Self {
        Self {
            opcode,
            sub_opcode: None,
        }
    }

    /// Await a reply opcode with a sub-opcode
    pub fn with_sub(opcode: u8, sub_opcode: u8) -> Self {
        Self {
            opcode,
            sub_opcode: Some(sub_opcode),
        }
    }

    /// True when `payload` is the awaited reply.
    ///
    /// The opcode must match; when a sub-opcode is awaited payload[1] must match too.
    pub fn matches(&self, payload: &[u8]) -> bool {
        match payload.first() {
            Some(&opcode) if opcode == self.opcode => match self.sub_opcode {
                None => true,
                Some(sub) => payload.get(1) == Some(&sub),
            },
            _ => false,
        }
    }
}

/// Resolve the reply awaited by an unescaped request payload.
///
/// Envelopes are unwrapped so the inner opcode decides. Returns `None` for
/// frames that get no reply (connected-path traffic, reply opcodes).
pub fn resolve_awaited_reply(payload: &[u8]) -> Result<Option<AwaitedReply>, WireError> {
    let first = *payload
        .first()
        .ok_or_else(|| WireError::Encoding("empty frame".to_string()))?;

    match Opcode::try_from(first)? {
        Opcode::Unicast => {
            if payload.len() <= UNICAST_HEADER_LEN {
                return Err(WireError::Truncated {
                    need: UNICAST_HEADER_LEN + 1,
                    got: payload.len(),
                });
            }
            resolve_awaited_reply(&payload[UNICAST_HEADER_LEN..])
        }
        Opcode::Multipath => {
            if payload.len() < MULTIPATH_HEADER_LEN {
                return Err(WireError::Truncated {
                    need: MULTIPATH_HEADER_LEN,
                    got: payload.len(),
                });
            }
            let inner = MULTIPATH_HEADER_LEN + 4 * payload[5] as usize;
            if payload.len() <= inner {
                return Err(WireError::Truncated {
                    need: inner + 1,
                    got: payload.len(),
                });
            }
            resolve_awaited_reply(&payload[inner..])
        }
        Opcode::ConnectedPathRequest => Ok(None),
        Opcode::DiscoveryRequest => {
            let sub = sub_opcode(payload)?;
            Ok(Some(AwaitedReply::with_sub(
                Opcode::DiscoveryReply as u8,
                awaited_reply(sub),
            )))
        }
        // Flash replies echo the request sub-opcode
        Opcode::FlashRequest => {
            let sub = sub_opcode(payload)?;
            Ok(Some(AwaitedReply::with_sub(Opcode::FlashReply as u8, sub)))
        }
        opcode if opcode.is_request() => Ok(Some(AwaitedReply::plain(awaited_reply(first)))),
        _ => Ok(None),
    }
}

fn sub_opcode(payload: &[u8]) -> Result<u8, WireError> {
    payload.get(1).copied().ok_or(WireError::Truncated {
        need: 2,
        got: payload.len(),
    })
}

/// One API frame (unescaped payload, opcode at payload[0])
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFrame {
    payload: Bytes,
}

impl ApiFrame {
    /// Wrap an unescaped payload
    pub fn new(payload: impl Into<Bytes>) -> Result<Self, WireError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(WireError::Encoding("empty frame".to_string()));
        }
        if payload.len() > MAX_FRAME_SIZE {
            return Err(WireError::Size(payload.len()));
        }
        Ok(Self { payload })
    }

    /// Parse a complete escaped frame including delimiters
    pub fn from_wire(raw: &[u8]) -> Result<Self, WireError> {
        match (raw.first(), raw.last()) {
            (Some(&START_BYTE), Some(&STOP_BYTE)) if raw.len() >= 2 => {
                Self::new(unescape(&raw[1..raw.len() - 1])?)
            }
            _ => Err(WireError::Malformed("missing frame delimiters")),
        }
    }

    /// Unescaped payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Opcode byte
    pub fn opcode(&self) -> u8 {
        self.payload[0]
    }

    /// Sub-opcode byte when present
    pub fn sub_opcode(&self) -> Option<u8> {
        self.payload.get(1).copied()
    }

    /// Escaped length of the payload (without delimiters)
    pub fn escaped_len(&self) -> usize {
        self.payload.len() + reserved_count(&self.payload)
    }

    /// Encode to `START escaped-payload STOP`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.escaped_len() + 2);
        buf.put_u8(START_BYTE);
        escape(&self.payload, &mut buf);
        buf.put_u8(STOP_BYTE);
        buf.freeze()
    }

    /// Reply this frame waits for, if any
    pub fn awaited_reply(&self) -> Result<Option<AwaitedReply>, WireError> {
        resolve_awaited_reply(&self.payload)
    }

    /// True when this frame satisfies `awaited`
    pub fn is_reply_to(&self, awaited: &AwaitedReply) -> bool {
        awaited.matches(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Hunting,
    Payload,
    Escaped,
}

/// Streaming decoder for incoming serial bytes
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    current: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom payload limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Hunting,
            current: BytesMut::with_capacity(256),
            max_frame_size,
        }
    }

    /// Drop any partial frame and wait for the next START byte
    pub fn reset(&mut self) {
        self.state = DecodeState::Hunting;
        self.current.clear();
    }

    /// Decode one frame from a buffer.
    ///
    /// Consumed bytes are removed from `buf`. Returns `Ok(None)` when more data
    /// is needed. An oversized frame is discarded and reported as
    /// [`WireError::Size`]; decoding can continue with the same buffer.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ApiFrame>, WireError> {
        let mut consumed = 0;
        let mut result = Ok(None);

        for &byte in buf.iter() {
            consumed += 1;
            match self.state {
                DecodeState::Hunting => {
                    if byte == START_BYTE {
                        self.current.clear();
                        self.state = DecodeState::Payload;
                    }
                }
                DecodeState::Payload => match byte {
                    ESCAPE_BYTE => self.state = DecodeState::Escaped,
                    STOP_BYTE => {
                        self.state = DecodeState::Hunting;
                        if self.current.is_empty() {
                            continue;
                        }
                        let payload = self.current.split().freeze();
                        result = Ok(Some(ApiFrame { payload }));
                        break;
                    }
                    START_BYTE => {
                        debug!("Restarting frame after {} bytes", self.current.len());
                        self.current.clear();
                    }
                    _ => {
                        if let Err(e) = self.push(byte) {
                            result = Err(e);
                            break;
                        }
                    }
                },
                DecodeState::Escaped => {
                    self.state = DecodeState::Payload;
                    if let Err(e) = self.push(byte) {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        buf.advance(consumed);
        result
    }

    fn push(&mut self, byte: u8) -> Result<(), WireError> {
        if self.current.len() >= self.max_frame_size {
            let len = self.current.len() + 1;
            self.reset();
            return Err(WireError::Size(len));
        }
        self.current.put_u8(byte);
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
