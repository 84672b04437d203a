//! Frame codec for the mesh hub serial link.
//!
//! This crate provides the low-level API frame implementation used between the
//! hub and the serial-attached coordinator, including byte-stuffed framing,
//! a streaming decoder, typed command/reply records and reply correlation.
//!
//! ## Wire Format
//!
//! ```text
//! +-------+--------------------------------------+------+
//! | 0xFE  | escaped payload (opcode, fields...)  | 0xEF |
//! +-------+--------------------------------------+------+
//! ```
//!
//! Payload bytes equal to 0xFE, 0xEA or 0xEF are prefixed with 0xEA.
//! Multi-byte fields are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod command;
pub mod connpath;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod opcode;
pub mod reply;

/// Mesh node address (24-bit range)
pub type MeshNodeId = u32;

// Re-export main types
pub use command::{Command, DiscoveryCommand, FlashCommand, DEFAULT_SLOT_NUM, SET_TAG_WIDTH};
pub use connpath::{
    ConnectedPathCommand, ConnectedPathReply, ConnectedPathRequest, OpenTarget,
    CONNECTED_PATH_PROTOCOL,
};
pub use envelope::Envelope;
pub use error::WireError;
pub use frame::{
    escape, resolve_awaited_reply, unescape, ApiFrame, AwaitedReply, FrameDecoder, ESCAPE_BYTE,
    MAX_FRAME_SIZE, START_BYTE, STOP_BYTE,
};
pub use opcode::{awaited_reply, Opcode};
pub use reply::{
    Associate, DiscoveryReply, DiscoveryTableItem, FlashReply, LogEvent, NodeConfig, Reply,
};
