//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Opcode (or sub-opcode) has no mapping
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Unknown sub-opcode inside a compound group
    #[error("unknown sub type {sub} for frame type {opcode}")]
    UnknownSubType {
        /// Outer opcode
        opcode: u8,
        /// Sub-opcode at payload[1]
        sub: u8,
    },

    /// Record cannot be represented on the wire
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Payload shorter than the record layout requires
    #[error("truncated frame: need {need} bytes, got {got}")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        got: usize,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
