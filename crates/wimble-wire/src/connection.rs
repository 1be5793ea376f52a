//! Per-connection tasks: one driver reading frames, one writer draining the
//! outbound lanes.
//!
//! The driver demultiplexes incoming frames onto registered streams and
//! answers inbound `Open` frames through the [`ProtocolRouter`]. It never
//! waits on the writer, so a stalled socket cannot hold up reads. When the
//! remote hangs up, the connection fails, or the host shuts down, every open
//! stream is reset locally and remotely and the connection leaves the host's
//! table.

use crate::error::{WireError, WireResult};
use crate::frame::{Frame, FrameKind};
use crate::handshake::{RecordReader, RecordWriter, Role, Session};
use crate::identity::PeerId;
use crate::router::{ProtocolRouter, StreamHandler};
use crate::stream::{Stream, StreamEvent, StreamState};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Live connections keyed by remote peer.
pub(crate) type ConnectionTable = Arc<DashMap<PeerId, Arc<ConnectionShared>>>;

/// Data frames queued for the writer before stream writers wait.
const OUTBOUND_QUEUE: usize = 256;

/// Control frames allowed to wait for the writer before the connection is
/// considered stalled.
const CONTROL_QUEUE_LIMIT: usize = 1024;

/// How long the writer gets to finish after the driver stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Work items on the control lane.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// Shut down the write half.
    Close,
}

/// The writer's ends of a connection's two outbound lanes.
///
/// Data and half-close frames go through a bounded queue so stream writers
/// wait on a slow socket. Open, Ack, Window and Reset frames go through the
/// control lane, which never blocks its sender and is drained first.
pub(crate) struct Outbox {
    pub(crate) frames: mpsc::Receiver<Frame>,
    pub(crate) control: mpsc::UnboundedReceiver<Outbound>,
    depth: Arc<AtomicUsize>,
}

impl Outbox {
    /// Next item to write, control lane first.
    pub(crate) async fn next(&mut self) -> Option<Outbound> {
        let out = tokio::select! {
            biased;
            out = self.control.recv() => out,
            frame = self.frames.recv() => return frame.map(Outbound::Frame),
        };
        if matches!(out, Some(Outbound::Frame(_))) {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        out
    }
}

/// Registration of one stream on its connection.
#[derive(Clone)]
struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
    state: Arc<StreamState>,
}

/// State shared between a connection's tasks and its streams.
pub(crate) struct ConnectionShared {
    remote: PeerId,
    role: Role,
    frames: mpsc::Sender<Frame>,
    control: mpsc::UnboundedSender<Outbound>,
    control_depth: Arc<AtomicUsize>,
    streams: DashMap<u32, StreamSlot>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn new(remote: PeerId, role: Role) -> (Arc<Self>, Outbox) {
        let (frames, frames_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (control, control_rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let first_id = match role {
            Role::Dialer => 1,
            Role::Listener => 2,
        };
        let shared = Arc::new(Self {
            remote,
            role,
            frames,
            control,
            control_depth: Arc::clone(&depth),
            streams: DashMap::new(),
            next_stream_id: AtomicU32::new(first_id),
            closed: AtomicBool::new(false),
        });
        let outbox = Outbox {
            frames: frames_rx,
            control: control_rx,
            depth,
        };
        (shared, outbox)
    }

    pub(crate) fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Streams currently registered on this connection.
    pub(crate) fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Next locally-initiated stream id (odd for the dialer, even for the listener).
    pub(crate) fn next_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    fn is_remote_initiated(&self, id: u32) -> bool {
        let remote_parity = match self.role {
            Role::Dialer => 0,
            Role::Listener => 1,
        };
        id != 0 && id % 2 == remote_parity
    }

    pub(crate) fn register(
        &self,
        id: u32,
    ) -> (Arc<StreamState>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState::new());
        self.streams.insert(
            id,
            StreamSlot {
                events,
                state: Arc::clone(&state),
            },
        );
        (state, rx)
    }

    pub(crate) fn unregister(&self, id: u32) {
        self.streams.remove(&id);
    }

    /// Hand an event to a stream. A reset also unregisters it.
    ///
    /// Data beyond the stream's receive window resets the stream and asks
    /// the remote to do the same.
    pub(crate) fn deliver(&self, id: u32, event: StreamEvent) -> WireResult<()> {
        let Some(slot) = self.streams.get(&id).map(|entry| entry.value().clone()) else {
            debug!(stream = id, peer = %self.remote, "frame for unknown stream ignored");
            return Ok(());
        };
        let forward = match &event {
            StreamEvent::Reset => {
                self.streams.remove(&id);
                slot.state.mark_reset();
                true
            }
            StreamEvent::Data(bytes) if bytes.is_empty() => false,
            StreamEvent::Data(bytes) => {
                if !slot.state.buffer(bytes.len()) {
                    warn!(stream = id, peer = %self.remote, "P2P: stream receive window exceeded, resetting");
                    self.streams.remove(&id);
                    slot.state.mark_reset();
                    let _ = slot.events.send(StreamEvent::Reset);
                    return self.send_control(Frame::control(FrameKind::Reset, id));
                }
                true
            }
            StreamEvent::Eof => slot.state.close_remote(),
            StreamEvent::Accepted => slot.state.accept(),
        };
        if forward {
            let _ = slot.events.send(event);
        }
        Ok(())
    }

    /// Give a stream more send credit.
    pub(crate) fn grant(&self, id: u32, credit: u32) {
        match self.streams.get(&id) {
            Some(slot) => slot.state.grant(credit),
            None => debug!(stream = id, peer = %self.remote, "window for unknown stream ignored"),
        }
    }

    /// Queue a data-lane frame, waiting while the writer is behind.
    pub(crate) async fn send(&self, frame: Frame) -> WireResult<()> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        self.frames
            .send(frame)
            .await
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Queue a control frame without waiting.
    pub(crate) fn send_control(&self, frame: Frame) -> WireResult<()> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        if self.control_depth.load(Ordering::Acquire) >= CONTROL_QUEUE_LIMIT {
            return Err(WireError::OutboundQueueFull);
        }
        self.enqueue_control(frame)
    }

    fn enqueue_control(&self, frame: Frame) -> WireResult<()> {
        self.control_depth.fetch_add(1, Ordering::AcqRel);
        self.control.send(Outbound::Frame(frame)).map_err(|_| {
            self.control_depth.fetch_sub(1, Ordering::AcqRel);
            WireError::ConnectionClosed
        })
    }

    /// Open an outbound stream and wait for the remote to accept it.
    pub(crate) async fn open_stream(self: &Arc<Self>, protocol: &str) -> WireResult<Stream> {
        let id = self.next_stream_id();
        // Built before sending so that every failure below resets and unregisters.
        let mut stream = Stream::new(id, protocol.to_string(), Arc::clone(self));
        self.send_control(Frame::new(
            FrameKind::Open,
            id,
            Bytes::copy_from_slice(protocol.as_bytes()),
        ))?;
        stream.await_accept().await?;
        debug!(stream = id, protocol, peer = %self.remote, "outbound stream accepted");
        Ok(stream)
    }

    /// Apply one inbound frame. Never waits on the writer; an error drops
    /// the connection.
    fn dispatch(self: &Arc<Self>, frame: Frame, router: &ProtocolRouter) -> WireResult<()> {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Open => self.accept_stream(id, frame.payload, router),
            FrameKind::Ack => self.deliver(id, StreamEvent::Accepted),
            FrameKind::Data => self.deliver(id, StreamEvent::Data(frame.payload)),
            FrameKind::Close => self.deliver(id, StreamEvent::Eof),
            FrameKind::Reset => self.deliver(id, StreamEvent::Reset),
            FrameKind::Window => {
                let credit = frame.credit().ok_or_else(|| {
                    WireError::InvalidFrame(format!("malformed window frame on stream {id}"))
                })?;
                self.grant(id, credit);
                Ok(())
            }
        }
    }

    fn accept_stream(
        self: &Arc<Self>,
        id: u32,
        payload: Bytes,
        router: &ProtocolRouter,
    ) -> WireResult<()> {
        if !self.is_remote_initiated(id) || self.streams.contains_key(&id) {
            return Err(WireError::InvalidFrame(format!(
                "remote opened invalid stream id {id}"
            )));
        }

        let protocol = String::from_utf8_lossy(&payload).into_owned();
        match router.route(&protocol) {
            Some(handler) => {
                let stream = Stream::new(id, protocol, Arc::clone(self));
                self.send_control(Frame::control(FrameKind::Ack, id))?;
                debug!(stream = id, protocol = stream.protocol(), peer = %self.remote, "inbound stream accepted");
                tokio::spawn(run_handler(handler, stream));
            }
            None => {
                warn!(
                    peer = %self.remote,
                    stream = id,
                    error = %WireError::UnsupportedProtocol(protocol),
                    "P2P: rejecting inbound stream"
                );
                self.send_control(Frame::control(FrameKind::Reset, id))?;
            }
        }
        Ok(())
    }

    /// Reset every stream, then ask the writer to finish.
    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.streams.remove(&id) {
                slot.state.mark_reset();
                let _ = slot.events.send(StreamEvent::Reset);
                let _ = self.enqueue_control(Frame::control(FrameKind::Reset, id));
            }
        }
        let _ = self.control.send(Outbound::Close);
    }
}

/// Start the driver and writer tasks for an established session and add the
/// connection to `table`.
pub(crate) fn spawn<R, W>(
    session: Session<R, W>,
    role: Role,
    router: Arc<ProtocolRouter>,
    shutdown: watch::Receiver<bool>,
    table: ConnectionTable,
) -> (Arc<ConnectionShared>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Session {
        remote_peer,
        reader,
        writer,
    } = session;

    let (shared, outbox) = ConnectionShared::new(remote_peer.clone(), role);
    if table.insert(remote_peer, Arc::clone(&shared)).is_some() {
        debug!(peer = %shared.remote, "replacing existing connection");
    }

    let writer_task = tokio::spawn(write_loop(writer, outbox));
    let driver = tokio::spawn(drive(
        reader,
        Arc::clone(&shared),
        router,
        shutdown,
        table,
        writer_task,
    ));
    (shared, driver)
}

async fn drive<R>(
    mut reader: RecordReader<R>,
    shared: Arc<ConnectionShared>,
    router: Arc<ProtocolRouter>,
    mut shutdown: watch::Receiver<bool>,
    table: ConnectionTable,
    mut writer_task: JoinHandle<()>,
) where
    R: AsyncRead + Unpin,
{
    let peer = shared.remote.clone();
    loop {
        if *shutdown.borrow_and_update() {
            debug!("P2P: closing connection with {} for shutdown", peer);
            break;
        }
        let next = tokio::select! {
            next = reader.recv() => next,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        match next {
            Ok(Some(frame)) => {
                if let Err(e) = shared.dispatch(frame, &router) {
                    warn!("P2P: dropping connection with {}: {}", peer, e);
                    break;
                }
            }
            Ok(None) => {
                debug!("P2P: connection closed by {}", peer);
                break;
            }
            Err(e) => {
                debug!("P2P: connection with {} ended: {}", peer, e);
                break;
            }
        }
    }

    shared.teardown();
    table.remove_if(&peer, |_, current| Arc::ptr_eq(current, &shared));
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
}

async fn write_loop<W>(mut writer: RecordWriter<W>, mut outbox: Outbox)
where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = outbox.next().await {
        match out {
            Outbound::Frame(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    debug!("P2P: connection write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Run one inbound handler. `Ok` closes the stream, `Err` resets it.
async fn run_handler(handler: Arc<dyn StreamHandler>, mut stream: Stream) {
    let id = stream.id();
    let peer = stream.remote_peer().clone();
    let protocol = stream.protocol().to_string();
    match handler.handle(&mut stream).await {
        Ok(()) => {
            if let Err(e) = stream.close().await {
                debug!(stream = id, %peer, %protocol, error = %e, "closing stream failed");
            }
        }
        Err(e) => {
            warn!(stream = id, %peer, %protocol, error = %e, "P2P: stream handler failed, resetting");
            stream.reset().await;
        }
    }
}
