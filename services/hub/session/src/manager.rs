//! Single-flight request queue over the coordinator link.
//!
//! The coordinator is half duplex and can only correlate one outstanding
//! request, so every caller goes through one FIFO queue drained by a writer
//! task. A request that awaits a reply occupies the in-flight slot until the
//! reader task matches its reply or the deadline expires; nothing else is
//! written meanwhile. Frames that match no request are forwarded as
//! [`PushEvent`]s.

use crate::SessionError;
use bytes::BytesMut;
use hub_routing::{build_frame, MeshProtocol};
use hub_topology::{fmt_node_id, NetworkHandle};
use hub_wire::reply::DISCOVERY_ASSOCIATE;
use hub_wire::{
    ApiFrame, Associate, AwaitedReply, Command, ConnectedPathReply, DiscoveryReply, FrameDecoder,
    LogEvent, MeshNodeId, Opcode, Reply,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Default reply deadline
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Default pause after a frame that awaits no reply
pub const DEFAULT_WRITE_GUARD: Duration = Duration::from_millis(50);

/// Session manager settings
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for a reply, counted from the moment the request is written
    pub reply_timeout: Duration,
    /// Pause after fire-and-forget frames, leaves room for radio retries
    pub write_guard: Duration,
    /// Initial read buffer capacity
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            write_guard: DEFAULT_WRITE_GUARD,
            read_buffer_size: 4 * 1024,
        }
    }
}

/// Unsolicited frames received from the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// Log line from a node
    Log(LogEvent),
    /// Connected-path traffic for a virtual circuit
    ConnectedPath(ConnectedPathReply),
    /// A node reported its best neighbours
    Associate(Associate),
}

/// Link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames written
    pub frames_out: u64,
    /// Frames decoded
    pub frames_in: u64,
    /// Raw bytes written
    pub bytes_out: u64,
    /// Raw bytes read
    pub bytes_in: u64,
    /// Requests that ran out of time
    pub timeouts: u64,
    /// Frames dropped by the decoder
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_out: AtomicU64,
    frames_in: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    timeouts: AtomicU64,
    decode_errors: AtomicU64,
}

type ReplyTx = oneshot::Sender<Result<ApiFrame, SessionError>>;

struct Pending {
    awaited: AwaitedReply,
    timeout: Duration,
    reply_tx: ReplyTx,
}

struct QueuedFrame {
    frame: ApiFrame,
    pending: Option<Pending>,
}

struct InFlight {
    awaited: AwaitedReply,
    reply_tx: ReplyTx,
}

struct Shared {
    in_flight: Mutex<Option<InFlight>>,
    released: Notify,
    link: watch::Sender<bool>,
    local_node: AtomicU32,
    network: RwLock<Option<NetworkHandle>>,
    counters: Counters,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    async fn disconnect(&self) {
        if self.link.send_replace(false) {
            warn!("Coordinator link marked disconnected");
        }
        if let Some(in_flight) = self.in_flight.lock().await.take() {
            let _ = in_flight.reply_tx.send(Err(SessionError::Disconnected));
        }
        self.released.notify_one();
    }

    /// Block until the in-flight slot is empty, the link drops or `deadline` passes
    async fn wait_released(&self, deadline: Instant) {
        let mut link = self.link.subscribe();
        loop {
            let released = self.released.notified();
            if self.in_flight.lock().await.is_none() {
                return;
            }
            if !*link.borrow() {
                if let Some(in_flight) = self.in_flight.lock().await.take() {
                    let _ = in_flight.reply_tx.send(Err(SessionError::Disconnected));
                }
                return;
            }
            tokio::select! {
                _ = released => {}
                _ = link.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(in_flight) = self.in_flight.lock().await.take() {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Reply timeout waiting for {:02X}/{:?}",
                            in_flight.awaited.opcode, in_flight.awaited.sub_opcode
                        );
                        let _ = in_flight.reply_tx.send(Err(SessionError::ReplyTimeout));
                    }
                    return;
                }
            }
        }
    }
}

/// Cloneable handle to the coordinator link
#[derive(Clone)]
pub struct SessionManager {
    queue: mpsc::UnboundedSender<QueuedFrame>,
    shared: Arc<Shared>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("connected", &self.is_connected())
            .field("local_node", &fmt_node_id(self.local_node()))
            .finish()
    }
}

impl SessionManager {
    /// Spawn the reader and writer tasks over `stream`.
    ///
    /// Returns the manager and the receiver of unsolicited frames.
    pub fn start<S>(stream: S, config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<PushEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(true);

        let shared = Arc::new(Shared {
            in_flight: Mutex::new(None),
            released: Notify::new(),
            link,
            local_node: AtomicU32::new(0),
            network: RwLock::new(None),
            counters: Counters::default(),
        });

        tokio::spawn(write_loop(
            writer,
            queue_rx,
            shared.clone(),
            config.write_guard,
        ));
        tokio::spawn(read_loop(
            reader,
            push_tx,
            shared.clone(),
            config.read_buffer_size,
        ));

        let manager = Self {
            queue: queue_tx,
            shared,
            config,
        };
        (manager, push_rx)
    }

    /// True until the link fails
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Resolves once the link is down
    pub async fn closed(&self) {
        link_down(&mut self.shared.link.subscribe()).await
    }

    /// Coordinator node id, 0 until probed
    pub fn local_node(&self) -> MeshNodeId {
        self.shared.local_node.load(Ordering::Relaxed)
    }

    /// Record the coordinator node id
    pub fn set_local_node(&self, id: MeshNodeId) {
        self.shared.local_node.store(id, Ordering::Relaxed);
    }

    /// Use `network` for protocol selection and multipath hops
    pub async fn attach_network(&self, network: NetworkHandle) {
        *self.shared.network.write().await = Some(network);
    }

    /// Currently attached network
    pub async fn network(&self) -> Option<NetworkHandle> {
        self.shared.network.read().await.clone()
    }

    /// Snapshot of the link counters
    pub fn stats(&self) -> SessionStats {
        let c = &self.shared.counters;
        SessionStats {
            frames_out: c.frames_out.load(Ordering::Relaxed),
            frames_in: c.frames_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Queue a command for the coordinator itself without waiting
    pub fn send(&self, command: &Command) -> Result<(), SessionError> {
        self.send_frame(command.to_frame()?)
    }

    /// Queue a prebuilt frame without waiting
    pub fn send_frame(&self, frame: ApiFrame) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Disconnected);
        }
        self.queue
            .send(QueuedFrame {
                frame,
                pending: None,
            })
            .map_err(|_| SessionError::Disconnected)
    }

    /// Send a command to `target` and wait for its reply
    pub async fn send_receive(
        &self,
        command: &Command,
        protocol: MeshProtocol,
        target: MeshNodeId,
    ) -> Result<Reply, SessionError> {
        self.send_receive_timeout(command, protocol, target, None)
            .await
    }

    /// Like [`SessionManager::send_receive`] with an optional deadline override
    pub async fn send_receive_timeout(
        &self,
        command: &Command,
        protocol: MeshProtocol,
        target: MeshNodeId,
        timeout: Option<Duration>,
    ) -> Result<Reply, SessionError> {
        let frame = self.route(command, protocol, target).await?;
        let reply = self.send_receive_frame(frame, timeout).await?;
        Ok(Reply::from_frame(&reply)?)
    }

    /// Queue a prebuilt frame and wait for the frame answering it
    pub async fn send_receive_frame(
        &self,
        frame: ApiFrame,
        timeout: Option<Duration>,
    ) -> Result<ApiFrame, SessionError> {
        let awaited = frame
            .awaited_reply()?
            .ok_or(SessionError::NoReplyExpected(frame.opcode()))?;
        if !self.is_connected() {
            return Err(SessionError::Disconnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(QueuedFrame {
                frame,
                pending: Some(Pending {
                    awaited,
                    timeout: timeout.unwrap_or(self.config.reply_timeout),
                    reply_tx,
                }),
            })
            .map_err(|_| SessionError::Disconnected)?;

        reply_rx.await.map_err(|_| SessionError::Disconnected)?
    }

    async fn route(
        &self,
        command: &Command,
        protocol: MeshProtocol,
        target: MeshNodeId,
    ) -> Result<ApiFrame, SessionError> {
        let protocol = if target == self.local_node() {
            MeshProtocol::Direct
        } else {
            protocol
        };
        let handle = self.shared.network.read().await.clone();
        let frame = match handle {
            Some(handle) => {
                let network = handle.read().await;
                build_frame(command, protocol, target, Some(&network))?
            }
            None => build_frame(command, protocol, target, None)?,
        };
        Ok(frame)
    }
}

async fn link_down(link: &mut watch::Receiver<bool>) {
    let _ = link.wait_for(|up| !*up).await;
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut queue: mpsc::UnboundedReceiver<QueuedFrame>,
    shared: Arc<Shared>,
    write_guard: Duration,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut link = shared.link.subscribe();

    loop {
        let queued = tokio::select! {
            queued = queue.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
            _ = link_down(&mut link) => break,
        };

        let QueuedFrame { frame, pending } = queued;
        let deadline_after = match pending {
            Some(pending) => {
                // Installed before the write so a fast reply is not missed
                *shared.in_flight.lock().await = Some(InFlight {
                    awaited: pending.awaited,
                    reply_tx: pending.reply_tx,
                });
                Some(pending.timeout)
            }
            None => None,
        };

        let bytes = frame.encode();
        trace!("To serial len={} opcode={:02X}", bytes.len(), frame.opcode());
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            error!("Write to serial port failed: {}", e);
            shared.disconnect().await;
            break;
        }
        shared.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        shared
            .counters
            .bytes_out
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        match deadline_after {
            Some(timeout) => shared.wait_released(Instant::now() + timeout).await,
            None => tokio::time::sleep(write_guard).await,
        }
    }

    queue.close();
    while let Some(queued) = queue.recv().await {
        if let Some(pending) = queued.pending {
            let _ = pending.reply_tx.send(Err(SessionError::Disconnected));
        }
    }
    debug!("Serial writer stopped");
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    push: mpsc::UnboundedSender<PushEvent>,
    shared: Arc<Shared>,
    buffer_size: usize,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(buffer_size);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                info!("Serial link closed by the device");
                break;
            }
            Ok(n) => {
                shared
                    .counters
                    .bytes_in
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                error!("Read from serial port failed: {}", e);
                break;
            }
        }

        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => dispatch(frame, &push, &shared).await,
                Ok(None) => break,
                Err(e) => {
                    shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping frame: {}", e);
                }
            }
        }
    }

    shared.disconnect().await;
}

async fn dispatch(frame: ApiFrame, push: &mpsc::UnboundedSender<PushEvent>, shared: &Shared) {
    shared.counters.frames_in.fetch_add(1, Ordering::Relaxed);
    let opcode = frame.opcode();

    if opcode == Opcode::LogEvent as u8 {
        match Reply::from_frame(&frame) {
            Ok(Reply::LogEvent(event)) => {
                emit_node_log(&event);
                let _ = push.send(PushEvent::Log(event));
            }
            Ok(_) => {}
            Err(e) => warn!("Can't decode log event: {}", e),
        }
        return;
    }
    trace!("From serial len={} opcode={:02X}", frame.payload().len(), opcode);

    if opcode == Opcode::ConnectedPathReply as u8 {
        match Reply::from_frame(&frame) {
            Ok(Reply::ConnectedPath(reply)) => {
                let _ = push.send(PushEvent::ConnectedPath(reply));
            }
            Ok(_) => {}
            Err(e) => warn!("Can't decode connected path frame: {}", e),
        }
        return;
    }

    {
        let mut slot = shared.in_flight.lock().await;
        let matched = slot
            .as_ref()
            .is_some_and(|in_flight| frame.is_reply_to(&in_flight.awaited));
        if matched {
            if let Some(in_flight) = slot.take() {
                let _ = in_flight.reply_tx.send(Ok(frame));
            }
            shared.released.notify_one();
            return;
        }
        if let Some(in_flight) = slot.as_ref() {
            debug!(
                "Frame {:02X} does not answer awaited {:02X}/{:?}",
                opcode, in_flight.awaited.opcode, in_flight.awaited.sub_opcode
            );
        }
    }

    if opcode == Opcode::DiscoveryReply as u8 && frame.sub_opcode() == Some(DISCOVERY_ASSOCIATE) {
        match Reply::from_frame(&frame) {
            Ok(Reply::Discovery(DiscoveryReply::Associate(assoc))) => {
                let _ = push.send(PushEvent::Associate(assoc));
            }
            Ok(_) => {}
            Err(e) => warn!("Can't decode associate frame: {}", e),
        }
        return;
    }

    warn!("Unused frame {:02X} received", opcode);
}

/// Re-emit a node log line, levels follow the node firmware numbering
fn emit_node_log(event: &LogEvent) {
    let from = fmt_node_id(event.from);
    match event.level {
        0 | 1 => error!(component = "node", node = %from, "{}", event.line),
        2 => warn!(component = "node", node = %from, "{}", event.line),
        3 => info!(component = "node", node = %from, "{}", event.line),
        4 | 5 => debug!(component = "node", node = %from, "{}", event.line),
        _ => trace!(component = "node", node = %from, "{}", event.line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_wire::ConnectedPathCommand;
    use tokio::io::DuplexStream;

    struct FakeCoordinator {
        io: DuplexStream,
        decoder: FrameDecoder,
        buf: BytesMut,
    }

    impl FakeCoordinator {
        fn new(io: DuplexStream) -> Self {
            Self {
                io,
                decoder: FrameDecoder::new(),
                buf: BytesMut::new(),
            }
        }

        async fn next_command(&mut self) -> Option<Command> {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return Some(Command::decode(frame.payload()).unwrap());
                }
                if self.io.read_buf(&mut self.buf).await.ok()? == 0 {
                    return None;
                }
            }
        }

        async fn reply(&mut self, reply: Reply) {
            let frame = reply.to_frame().unwrap();
            self.io.write_all(&frame.encode()).await.unwrap();
        }
    }

    fn start(config: SessionConfig) -> (SessionManager, mpsc::UnboundedReceiver<PushEvent>, FakeCoordinator) {
        let (hub_side, fake_side) = tokio::io::duplex(4096);
        let (manager, push) = SessionManager::start(hub_side, config);
        (manager, push, FakeCoordinator::new(fake_side))
    }

    #[tokio::test]
    async fn test_send_receive_echo() {
        let (manager, _push, mut fake) = start(SessionConfig::default());
        tokio::spawn(async move {
            while let Some(cmd) = fake.next_command().await {
                if let Command::Echo(text) = cmd {
                    fake.reply(Reply::Echo(text)).await;
                }
            }
        });

        let reply = manager
            .send_receive(&Command::Echo("ping".into()), MeshProtocol::Direct, 0)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Echo("ping".into()));
        assert_eq!(manager.stats().frames_out, 1);
        assert_eq!(manager.stats().frames_in, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_fifo_and_single_flight() {
        let (manager, _push, mut fake) = start(SessionConfig::default());
        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(cmd) = fake.next_command().await {
                let Command::Echo(text) = cmd else { continue };
                // Nothing else may arrive while this request is unanswered
                let mut probe = [0u8; 1];
                let early = tokio::time::timeout(
                    Duration::from_millis(100),
                    fake.io.read(&mut probe),
                )
                .await;
                assert!(early.is_err(), "second request written before reply");
                seen.push(text.clone());
                fake.reply(Reply::Echo(text)).await;
                if seen.len() == 3 {
                    break;
                }
            }
            seen
        });

        let (ca, cb, cc) = (
            Command::Echo("a".into()),
            Command::Echo("b".into()),
            Command::Echo("c".into()),
        );
        let (a, b, c) = tokio::join!(
            manager.send_receive(&ca, MeshProtocol::Direct, 0),
            manager.send_receive(&cb, MeshProtocol::Direct, 0),
            manager.send_receive(&cc, MeshProtocol::Direct, 0),
        );
        assert_eq!(a.unwrap(), Reply::Echo("a".into()));
        assert_eq!(b.unwrap(), Reply::Echo("b".into()));
        assert_eq!(c.unwrap(), Reply::Echo("c".into()));
        assert_eq!(seen.await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout_releases_slot() {
        let (manager, _push, mut fake) = start(SessionConfig::default());
        tokio::spawn(async move {
            while let Some(cmd) = fake.next_command().await {
                match cmd {
                    Command::Echo(text) if text == "drop" => {}
                    Command::Echo(text) => fake.reply(Reply::Echo(text)).await,
                    _ => {}
                }
            }
        });

        let started = Instant::now();
        let err = manager
            .send_receive_timeout(
                &Command::Echo("drop".into()),
                MeshProtocol::Direct,
                0,
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ReplyTimeout));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(manager.stats().timeouts, 1);

        let reply = manager
            .send_receive(&Command::Echo("ok".into()), MeshProtocol::Direct, 0)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Echo("ok".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_delay_after_fire_and_forget() {
        let (manager, _push, mut fake) = start(SessionConfig::default());
        let arrivals = tokio::spawn(async move {
            let mut arrivals = Vec::new();
            while let Some(cmd) = fake.next_command().await {
                arrivals.push(Instant::now());
                if let Command::Echo(text) = cmd {
                    fake.reply(Reply::Echo(text)).await;
                    break;
                }
            }
            arrivals
        });

        manager.send(&Command::Reboot).unwrap();
        manager
            .send_receive(&Command::Echo("after".into()), MeshProtocol::Direct, 0)
            .await
            .unwrap();

        let arrivals = arrivals.await.unwrap();
        assert_eq!(arrivals.len(), 2);
        assert!(arrivals[1] - arrivals[0] >= DEFAULT_WRITE_GUARD);
    }

    #[tokio::test]
    async fn test_push_events_in_arrival_order() {
        let (_manager, mut push, mut fake) = start(SessionConfig::default());

        let log = LogEvent {
            level: 3,
            from: 0x42,
            line: "boot".into(),
        };
        let data = ConnectedPathReply {
            command: ConnectedPathCommand::SendData,
            handle: 7,
            data: bytes::Bytes::from_static(b"hi"),
        };
        let assoc = Associate {
            source: 0x42,
            server: 0x01,
            rssi: [-40, -60, 0],
            node_id: [0x01, 0x43, 0],
        };
        fake.reply(Reply::LogEvent(log.clone())).await;
        fake.reply(Reply::ConnectedPath(data.clone())).await;
        fake.reply(Reply::Discovery(DiscoveryReply::Associate(assoc)))
            .await;

        assert_eq!(push.recv().await.unwrap(), PushEvent::Log(log));
        assert_eq!(push.recv().await.unwrap(), PushEvent::ConnectedPath(data));
        assert_eq!(push.recv().await.unwrap(), PushEvent::Associate(assoc));
    }

    #[tokio::test]
    async fn test_link_loss_fails_callers() {
        let (manager, _push, fake) = start(SessionConfig::default());
        assert!(manager.is_connected());

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_receive(&Command::NodeId, MeshProtocol::Direct, 0)
                    .await
            })
        };
        tokio::task::yield_now().await;
        drop(fake);

        manager.closed().await;
        assert!(!manager.is_connected());
        assert!(matches!(
            pending.await.unwrap(),
            Err(SessionError::Disconnected)
        ));
        assert!(matches!(
            manager.send(&Command::Reboot),
            Err(SessionError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_fire_and_forget_has_no_reply() {
        let (manager, _push, _fake) = start(SessionConfig::default());
        let frame = Command::ConnectedPath(hub_wire::ConnectedPathRequest::clear_connections())
            .to_frame()
            .unwrap();
        assert!(matches!(
            manager.send_receive_frame(frame, None).await,
            Err(SessionError::NoReplyExpected(122))
        ));
    }
}
