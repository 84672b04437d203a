//! Long running procedures driven over the coordinator link.
//!
//! - [`DiscoveryProcedure`] walks the mesh from the coordinator outwards,
//!   asking every node for its neighbour table and turning RSSI readings into
//!   edge weights.
//! - [`apply_associate`] folds association reports pushed by joining nodes
//!   into the live graph.
//! - [`FirmwareUpload`] writes an image sector by sector, skipping sectors
//!   whose MD5 already matches, then boots it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod associate;
pub mod discovery;
pub mod firmware;
pub mod retry;

use hub_routing::RoutingError;
use hub_session::SessionError;
use hub_topology::GraphError;
use hub_wire::WireError;
use thiserror::Error;

// Re-export main types
pub use associate::{apply_associate, AssociateHandler};
pub use discovery::{
    DiscoveryConfig, DiscoveryMode, DiscoveryProcedure, DiscoveryState, NeighbourWeight,
    DEFAULT_SCAN_WAIT,
};
pub use firmware::{
    image_md5, upload_firmware, FirmwareRevisions, FirmwareUpload, FlashTarget, MeshFlashTarget,
    StepOutcome, DEFAULT_IMAGE_ADDRESS, SECTOR_SIZE, STEP_RETRIES, WRITE_CHUNK,
};
pub use retry::{with_retries, RETRY_TIMEOUTS};

/// Procedure errors
#[derive(Error, Debug)]
pub enum ProcedureError {
    /// Coordinator link failure or missing reply
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Request could not be routed
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Graph update rejected
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Reply could not be decoded
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// Image file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node answered with the wrong reply type
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Node refused a flash operation
    #[error("flash {operation} at 0x{address:06X} refused")]
    FlashRejected {
        /// Operation name
        operation: &'static str,
        /// Sector or chunk address
        address: u32,
    },

    /// Sector content differs after writing
    #[error("MD5 mismatch at 0x{0:06X} after write")]
    Md5Mismatch(u32),

    /// Nothing to upload
    #[error("firmware image is empty")]
    EmptyImage,

    /// Image does not fit in the 32 bit flash address space
    #[error("image of {length} bytes at 0x{address:06X} exceeds the flash address space")]
    ImageOutOfRange {
        /// Flash address of the image
        address: u32,
        /// Image length in bytes
        length: usize,
    },
}

impl ProcedureError {
    /// True for failures worth repeating the same request for
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcedureError::Session(e) => e.is_retryable(),
            ProcedureError::UnexpectedReply(_) => true,
            _ => false,
        }
    }
}
