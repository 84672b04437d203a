//! Serial link, single-flight request queue and push-frame dispatch.
//!
//! The hub talks to the mesh through one serial-attached coordinator. This
//! crate owns that link: it opens the device, serialises every request from
//! every caller onto it with at most one reply outstanding, correlates replies
//! and hands unsolicited frames (node logs, circuit traffic, associate
//! reports) to whoever consumes the push channel.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hub_routing::MeshProtocol;
//! use hub_session::{open_serial, probe_coordinator, SerialConfig, SessionConfig, SessionManager};
//! use hub_wire::Command;
//!
//! # async fn example() -> Result<(), hub_session::SessionError> {
//! let stream = open_serial(&SerialConfig::default()).await?;
//! let (session, mut push) = SessionManager::start(stream, SessionConfig::default());
//! let coordinator = probe_coordinator(&session).await?;
//!
//! let reply = session
//!     .send_receive(&Command::FirmRev, MeshProtocol::Auto, 0x123456)
//!     .await?;
//! println!("{} -> {:?}", coordinator.node_id, reply);
//!
//! while let Some(event) = push.recv().await {
//!     println!("push {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handshake;
pub mod manager;
pub mod transport;

use hub_routing::RoutingError;
use hub_wire::WireError;
use thiserror::Error;

// Re-export main types
pub use handshake::{probe_coordinator, CoordinatorInfo, PROBE_TEXT};
pub use manager::{
    PushEvent, SessionConfig, SessionManager, SessionStats, DEFAULT_REPLY_TIMEOUT,
    DEFAULT_WRITE_GUARD,
};
pub use transport::{open_serial, SerialConfig, SerialStream, DEFAULT_BAUD_RATE, DEFAULT_SERIAL_PORT};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// No matching reply before the deadline
    #[error("reply timeout")]
    ReplyTimeout,

    /// Link is down
    #[error("serial link disconnected")]
    Disconnected,

    /// Device I/O failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame could not be built or decoded
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    /// Target could not be routed
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Request awaits no reply
    #[error("opcode {0:#04x} does not expect a reply")]
    NoReplyExpected(u8),

    /// Reply decoded but not the one asked for
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl SessionError {
    /// True for failures worth retrying (the link is still usable)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ReplyTimeout | SessionError::Wire(_) | SessionError::UnexpectedReply(_)
        )
    }
}
