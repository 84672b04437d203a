//! Sector based firmware upload.
//!
//! The image is compared sector by sector against the node's flash using
//! MD5. Matching sectors are skipped; others are erased, written in chunks
//! and verified. Each [`FirmwareUpload::step`] performs a single remote
//! operation so a failed step can be repeated on its own.

use crate::retry::RETRY_TIMEOUTS;
use crate::ProcedureError;
use async_trait::async_trait;
use bytes::Bytes;
use hub_routing::MeshProtocol;
use hub_session::{SessionError, SessionManager};
use hub_topology::fmt_node_id;
use hub_wire::{Command, FlashCommand, FlashReply, MeshNodeId, Reply};
use md5::{Digest, Md5};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Flash sector size
pub const SECTOR_SIZE: usize = 4096;

/// Largest Write payload
pub const WRITE_CHUNK: usize = 512;

/// Flash address new images are staged at
pub const DEFAULT_IMAGE_ADDRESS: u32 = 0x10_0000;

/// Times a failed step is repeated before giving up
pub const STEP_RETRIES: usize = 3;

/// MD5 digest of `data`
pub fn image_md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// Node side of an upload
#[async_trait]
pub trait FlashTarget: Send + Sync {
    /// MD5 of `length` bytes at `address`
    async fn get_md5(&self, address: u32, length: u32) -> Result<[u8; 16], ProcedureError>;

    /// Erase `length` bytes at `address`
    async fn erase(&self, address: u32, length: u32) -> Result<(), ProcedureError>;

    /// Write one chunk
    async fn write(&self, address: u32, data: Bytes) -> Result<(), ProcedureError>;

    /// Mark the image at `address` as the next boot image
    async fn eboot(&self, address: u32, length: u32) -> Result<(), ProcedureError>;

    /// Running firmware revision
    async fn firmware_revision(&self) -> Result<String, ProcedureError>;

    /// Restart the node
    async fn reboot(&self) -> Result<(), ProcedureError>;
}

/// [`FlashTarget`] reached through the coordinator
#[derive(Debug, Clone)]
pub struct MeshFlashTarget {
    session: SessionManager,
    node: MeshNodeId,
    protocol: MeshProtocol,
    timeout: Duration,
}

impl MeshFlashTarget {
    /// Target `node`, routed automatically
    pub fn new(session: SessionManager, node: MeshNodeId) -> Self {
        Self {
            session,
            node,
            protocol: MeshProtocol::Auto,
            timeout: RETRY_TIMEOUTS[RETRY_TIMEOUTS.len() - 1],
        }
    }

    /// Node this target talks to
    pub fn node(&self) -> MeshNodeId {
        self.node
    }

    /// Override the protocol
    pub fn with_protocol(mut self, protocol: MeshProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Override the reply deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, command: Command) -> Result<Reply, ProcedureError> {
        let reply = self
            .session
            .send_receive_timeout(&command, self.protocol, self.node, Some(self.timeout))
            .await?;
        Ok(reply)
    }

    async fn flash(&self, command: FlashCommand) -> Result<FlashReply, ProcedureError> {
        match self.request(Command::Flash(command)).await? {
            Reply::Flash(reply) => Ok(reply),
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}

impl fmt::Display for MeshFlashTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", fmt_node_id(self.node), self.protocol)
    }
}

#[async_trait]
impl FlashTarget for MeshFlashTarget {
    async fn get_md5(&self, address: u32, length: u32) -> Result<[u8; 16], ProcedureError> {
        match self.flash(FlashCommand::GetMd5 { address, length }).await? {
            FlashReply::GetMd5 { md5, .. } => Ok(md5),
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn erase(&self, address: u32, length: u32) -> Result<(), ProcedureError> {
        match self.flash(FlashCommand::Erase { address, length }).await? {
            FlashReply::Erase { result: 0 } => Ok(()),
            FlashReply::Erase { result } => {
                warn!("Erase at 0x{:06X} failed with code {}", address, result);
                Err(ProcedureError::FlashRejected {
                    operation: "erase",
                    address,
                })
            }
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn write(&self, address: u32, data: Bytes) -> Result<(), ProcedureError> {
        match self.flash(FlashCommand::Write { address, data }).await? {
            FlashReply::Write { result: true } => Ok(()),
            FlashReply::Write { result: false } => Err(ProcedureError::FlashRejected {
                operation: "write",
                address,
            }),
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn eboot(&self, address: u32, length: u32) -> Result<(), ProcedureError> {
        match self.flash(FlashCommand::EBoot { address, length }).await? {
            FlashReply::EBoot => Ok(()),
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn firmware_revision(&self) -> Result<String, ProcedureError> {
        match self.request(Command::FirmRev).await? {
            Reply::FirmRev(revision) => Ok(revision),
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn reboot(&self) -> Result<(), ProcedureError> {
        match self.request(Command::Reboot).await? {
            Reply::Reboot => Ok(()),
            other => Err(ProcedureError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More steps needed
    Progress,
    /// Image written and boot requested
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Check,
    Erase,
    Write { offset: usize },
    Verify,
    Boot,
    Done,
}

/// Upload state for one image
pub struct FirmwareUpload<'a, T: FlashTarget + ?Sized> {
    target: &'a T,
    image: Bytes,
    address: u32,
    sector: usize,
    phase: Phase,
    skipped: usize,
    written: usize,
}

impl<'a, T: FlashTarget + ?Sized> FirmwareUpload<'a, T> {
    /// Upload `image` to flash at `address`
    pub fn new(target: &'a T, image: Bytes, address: u32) -> Result<Self, ProcedureError> {
        if image.is_empty() {
            return Err(ProcedureError::EmptyImage);
        }
        // The last sector is erased whole, so it must fit too
        let span = image.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        if u32::try_from(span)
            .ok()
            .and_then(|span| address.checked_add(span - 1))
            .is_none()
        {
            return Err(ProcedureError::ImageOutOfRange {
                address,
                length: image.len(),
            });
        }
        Ok(Self {
            target,
            image,
            address,
            sector: 0,
            phase: Phase::Check,
            skipped: 0,
            written: 0,
        })
    }

    /// Read the image from `path`
    pub async fn from_file(
        target: &'a T,
        path: impl AsRef<Path>,
        address: u32,
    ) -> Result<Self, ProcedureError> {
        let image = tokio::fs::read(path.as_ref()).await?;
        info!(
            "Firmware {} loaded, {} bytes",
            path.as_ref().display(),
            image.len()
        );
        Self::new(target, Bytes::from(image), address)
    }

    /// Number of sectors in the image
    pub fn sector_count(&self) -> usize {
        self.image.len().div_ceil(SECTOR_SIZE)
    }

    /// Sectors left untouched because they already matched
    pub fn skipped_sectors(&self) -> usize {
        self.skipped
    }

    /// Sectors erased and rewritten
    pub fn written_sectors(&self) -> usize {
        self.written
    }

    /// True once boot was requested
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Fraction of the image handled, in `[0, 1]`
    pub fn percent(&self) -> f64 {
        let within = match self.phase {
            Phase::Write { offset } => offset,
            Phase::Verify => self.sector_data().len(),
            Phase::Boot | Phase::Done => return 1.0,
            _ => 0,
        };
        let handled = self.sector * SECTOR_SIZE + within;
        (handled as f64 / self.image.len() as f64).min(1.0)
    }

    fn sector_address(&self) -> Result<u32, ProcedureError> {
        self.offset_address(self.sector * SECTOR_SIZE)
    }

    fn offset_address(&self, offset: usize) -> Result<u32, ProcedureError> {
        u32::try_from(offset)
            .ok()
            .and_then(|offset| self.address.checked_add(offset))
            .ok_or(ProcedureError::ImageOutOfRange {
                address: self.address,
                length: self.image.len(),
            })
    }

    fn sector_data(&self) -> Bytes {
        let start = self.sector * SECTOR_SIZE;
        let end = (start + SECTOR_SIZE).min(self.image.len());
        self.image.slice(start..end)
    }

    fn next_sector(&mut self) -> StepOutcome {
        self.sector += 1;
        self.phase = if self.sector >= self.sector_count() {
            Phase::Boot
        } else {
            Phase::Check
        };
        StepOutcome::Progress
    }

    /// Perform the next remote operation
    pub async fn step(&mut self) -> Result<StepOutcome, ProcedureError> {
        match self.phase {
            Phase::Check => {
                let data = self.sector_data();
                let address = self.sector_address()?;
                let remote = self.target.get_md5(address, data.len() as u32).await?;
                if remote == image_md5(&data) {
                    debug!("Sector 0x{:06X} unchanged", address);
                    self.skipped += 1;
                    return Ok(self.next_sector());
                }
                self.phase = Phase::Erase;
                Ok(StepOutcome::Progress)
            }
            Phase::Erase => {
                self.target
                    .erase(self.sector_address()?, SECTOR_SIZE as u32)
                    .await?;
                self.phase = Phase::Write { offset: 0 };
                Ok(StepOutcome::Progress)
            }
            Phase::Write { offset } => {
                let data = self.sector_data();
                let end = (offset + WRITE_CHUNK).min(data.len());
                let address = self.offset_address(self.sector * SECTOR_SIZE + offset)?;
                self.target
                    .write(address, data.slice(offset..end))
                    .await?;
                self.phase = if end >= data.len() {
                    Phase::Verify
                } else {
                    Phase::Write { offset: end }
                };
                Ok(StepOutcome::Progress)
            }
            Phase::Verify => {
                let data = self.sector_data();
                let address = self.sector_address()?;
                let remote = self.target.get_md5(address, data.len() as u32).await?;
                if remote != image_md5(&data) {
                    return Err(ProcedureError::Md5Mismatch(address));
                }
                self.written += 1;
                info!(
                    "Sector 0x{:06X} written ({:.0}%)",
                    address,
                    self.percent() * 100.0
                );
                Ok(self.next_sector())
            }
            Phase::Boot => {
                self.target
                    .eboot(self.address, self.image.len() as u32)
                    .await?;
                self.phase = Phase::Done;
                info!(
                    "Image booted from 0x{:06X}: {} sectors written, {} unchanged",
                    self.address, self.written, self.skipped
                );
                Ok(StepOutcome::Done)
            }
            Phase::Done => Ok(StepOutcome::Done),
        }
    }

    /// Step until done, repeating a failed step up to [`STEP_RETRIES`] times
    pub async fn run(&mut self) -> Result<(), ProcedureError> {
        let mut failures = 0;
        loop {
            match self.step().await {
                Ok(StepOutcome::Done) => return Ok(()),
                Ok(StepOutcome::Progress) => failures = 0,
                Err(e) if e.is_retryable() && failures < STEP_RETRIES => {
                    failures += 1;
                    warn!("Firmware step failed ({}/{}): {}", failures, STEP_RETRIES, e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Revisions reported around an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRevisions {
    /// Before the upload
    pub before: String,
    /// After the reboot
    pub after: String,
}

/// Upload `image`, reboot the node and read its revision again
pub async fn upload_firmware<T: FlashTarget + ?Sized>(
    target: &T,
    image: Bytes,
    address: u32,
    reboot_wait: Duration,
) -> Result<FirmwareRevisions, ProcedureError> {
    let before = target.firmware_revision().await?;
    info!("Firmware before upload: {}", before);

    let mut upload = FirmwareUpload::new(target, image, address)?;
    upload.run().await?;

    match target.reboot().await {
        Ok(()) => {}
        // The node may restart before its reply is sent
        Err(ProcedureError::Session(SessionError::ReplyTimeout)) => {
            debug!("No reply to reboot");
        }
        Err(e) => return Err(e),
    }
    tokio::time::sleep(reboot_wait).await;

    let mut attempt = 0;
    let after = loop {
        match target.firmware_revision().await {
            Ok(revision) => break revision,
            Err(e) if e.is_retryable() && attempt < STEP_RETRIES => {
                attempt += 1;
                debug!("Revision query after reboot failed: {}", e);
            }
            Err(e) => return Err(e),
        }
    };
    info!("Firmware after upload: {}", after);
    Ok(FirmwareRevisions { before, after })
}
