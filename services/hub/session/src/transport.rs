//! Serial device transport.
//!
//! By default the device node is opened as a plain file, which works for
//! adapters already configured with `stty`. Each direction gets its own
//! non-blocking handle, so a read waiting on the device never holds up a
//! write. The `serial` feature opens the port natively and applies the
//! configured baud rate.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

/// Default device path
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";

/// Default coordinator baud rate
pub const DEFAULT_BAUD_RATE: u32 = 460_800;

/// Serial device settings
#[derive(Clone, Debug)]
pub struct SerialConfig {
    /// Device path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[cfg(unix)]
type DeviceReader = tokio::net::unix::pipe::Receiver;
#[cfg(unix)]
type DeviceWriter = tokio::net::unix::pipe::Sender;
#[cfg(not(unix))]
type DeviceReader = tokio::fs::File;
#[cfg(not(unix))]
type DeviceWriter = tokio::fs::File;

/// Byte stream to the coordinator
pub enum SerialStream {
    /// Device node opened as a file, one handle per direction
    File {
        /// Handle used only for reading
        reader: DeviceReader,
        /// Handle used only for writing
        writer: DeviceWriter,
    },
    /// Natively configured serial port
    #[cfg(feature = "serial")]
    Native(tokio_serial::SerialStream),
}

impl AsyncRead for SerialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SerialStream::File { reader, .. } => Pin::new(reader).poll_read(cx, buf),
            #[cfg(feature = "serial")]
            SerialStream::Native(port) => Pin::new(port).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SerialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            SerialStream::File { writer, .. } => Pin::new(writer).poll_write(cx, buf),
            #[cfg(feature = "serial")]
            SerialStream::Native(port) => Pin::new(port).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            SerialStream::File { writer, .. } => Pin::new(writer).poll_flush(cx),
            #[cfg(feature = "serial")]
            SerialStream::Native(port) => Pin::new(port).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            SerialStream::File { writer, .. } => Pin::new(writer).poll_shutdown(cx),
            #[cfg(feature = "serial")]
            SerialStream::Native(port) => Pin::new(port).poll_shutdown(cx),
        }
    }
}

/// Open both directions of a device node without blocking threads
#[cfg(unix)]
async fn open_device(path: &str) -> io::Result<(DeviceReader, DeviceWriter)> {
    use tokio::net::unix::pipe;

    // Character devices are accepted as well as fifos
    let reader = pipe::OpenOptions::new().unchecked(true).open_receiver(path)?;
    let writer = pipe::OpenOptions::new().unchecked(true).open_sender(path)?;
    Ok((reader, writer))
}

#[cfg(not(unix))]
async fn open_device(path: &str) -> io::Result<(DeviceReader, DeviceWriter)> {
    let reader = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await?;
    let writer = reader.try_clone().await?;
    Ok((reader, writer))
}

/// Open the coordinator device
#[cfg(not(feature = "serial"))]
pub async fn open_serial(config: &SerialConfig) -> io::Result<SerialStream> {
    let (reader, writer) = open_device(&config.port).await?;
    info!(
        "Opened {} as a file, baud rate {} must be set externally",
        config.port, config.baud_rate
    );
    Ok(SerialStream::File { reader, writer })
}

/// Open the coordinator device
#[cfg(feature = "serial")]
pub async fn open_serial(config: &SerialConfig) -> io::Result<SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(&config.port, config.baud_rate)
        .open_native_async()
        .map_err(io::Error::from)?;
    info!("Opened {} at {} baud", config.port, config.baud_rate);
    Ok(SerialStream::Native(port))
}

#[cfg(all(test, unix, not(feature = "serial")))]
mod tests {
    use super::*;
    use crate::{SessionConfig, SessionError, SessionManager};
    use hub_routing::MeshProtocol;
    use hub_wire::{Command, Reply};
    use std::io::Write;
    use std::time::Duration;

    fn make_fifo(dir: &std::path::Path) -> String {
        let path = dir.join("coordinator");
        let status = std::process::Command::new("mkfifo")
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
        path.display().to_string()
    }

    fn serial_config(port: String) -> SerialConfig {
        SerialConfig {
            port,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_device_writes_while_read_pending() {
        let dir = tempfile::tempdir().unwrap();
        let port = make_fifo(dir.path());
        let stream = open_serial(&serial_config(port)).await.unwrap();
        let (manager, _push) = SessionManager::start(stream, SessionConfig::default());

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            manager.send_receive_timeout(
                &Command::Echo("CIAO".into()),
                MeshProtocol::Direct,
                0,
                Some(Duration::from_millis(200)),
            ),
        )
        .await
        .expect("request must resolve within its own deadline");

        assert!(matches!(outcome, Err(SessionError::ReplyTimeout)));
        assert_eq!(manager.stats().frames_out, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let port = make_fifo(dir.path());
        let stream = open_serial(&serial_config(port.clone())).await.unwrap();
        let (manager, _push) = SessionManager::start(stream, SessionConfig::default());

        let requester = manager.clone();
        let request = tokio::spawn(async move {
            requester
                .send_receive_timeout(
                    &Command::Echo("CIAO".into()),
                    MeshProtocol::Direct,
                    0,
                    Some(Duration::from_secs(2)),
                )
                .await
        });

        // The request frame loops back through the fifo first and is ignored
        while manager.stats().frames_out == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reply = Reply::Echo("CIAO".into()).to_frame().unwrap().encode();
        let mut device = std::fs::OpenOptions::new().write(true).open(&port).unwrap();
        device.write_all(&reply).unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(3), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::Echo("CIAO".into()));
    }
}
