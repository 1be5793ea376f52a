//! Multiplexed byte streams.
//!
//! A [`Stream`] is one ordered bidirectional channel on a connection, bound to
//! a remote peer and a negotiated protocol name. Reads go through
//! [`AsyncRead`]/[`AsyncBufRead`]; writes are split into frames and queued on
//! the connection's writer task.
//!
//! Every stream ends in exactly one of [`Stream::close`] or [`Stream::reset`].
//! Dropping a stream without either resets it.

use crate::connection::ConnectionShared;
use crate::error::{WireError, WireResult};
use crate::frame::{Frame, FrameKind, MAX_PAYLOAD, STREAM_WINDOW};
use crate::identity::PeerId;
use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Longest line accepted by [`read_line`], excluding the newline.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Consumed bytes returned to the remote in one `Window` frame.
const WINDOW_UPDATE_THRESHOLD: u32 = STREAM_WINDOW / 2;

/// Events delivered from the connection driver to a stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// The remote acknowledged our `Open`.
    Accepted,
    Data(Bytes),
    /// The remote will send no more data.
    Eof,
    Reset,
}

/// Flow-control state shared by a stream and its connection driver.
#[derive(Debug)]
pub(crate) struct StreamState {
    /// Bytes we may still send before the remote grants more.
    send_credit: AtomicU32,
    /// Bytes delivered to the stream and not yet read.
    buffered: AtomicUsize,
    accepted: AtomicBool,
    remote_closed: AtomicBool,
    reset: AtomicBool,
    credit_granted: Notify,
}

impl StreamState {
    pub(crate) fn new() -> Self {
        Self {
            send_credit: AtomicU32::new(STREAM_WINDOW),
            buffered: AtomicUsize::new(0),
            accepted: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            credit_granted: Notify::new(),
        }
    }

    /// Add credit from a `Window` frame and wake a waiting writer.
    pub(crate) fn grant(&self, credit: u32) {
        let _ = self
            .send_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(credit))
            });
        self.credit_granted.notify_one();
    }

    pub(crate) fn mark_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.credit_granted.notify_one();
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    /// Count `len` delivered bytes. False when they overrun the window.
    pub(crate) fn buffer(&self, len: usize) -> bool {
        self.buffered.fetch_add(len, Ordering::AcqRel) + len <= STREAM_WINDOW as usize
    }

    /// True for the first `Ack` only.
    pub(crate) fn accept(&self) -> bool {
        !self.accepted.swap(true, Ordering::SeqCst)
    }

    /// True for the first `Close` only.
    pub(crate) fn close_remote(&self) -> bool {
        !self.remote_closed.swap(true, Ordering::SeqCst)
    }

    fn consumed(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
    }

    /// Take up to `want` bytes of send credit, waiting until some is granted.
    async fn reserve(&self, want: usize) -> WireResult<usize> {
        loop {
            if self.is_reset() {
                return Err(WireError::StreamReset);
            }
            let available = self.send_credit.load(Ordering::Acquire) as usize;
            if available > 0 {
                let n = available.min(want);
                self.send_credit.fetch_sub(n as u32, Ordering::AcqRel);
                return Ok(n);
            }
            self.credit_granted.notified().await;
        }
    }
}

/// One bidirectional stream on a connection.
pub struct Stream {
    id: u32,
    protocol: String,
    conn: Arc<ConnectionShared>,
    state: Arc<StreamState>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    pending: Bytes,
    /// Bytes read since the last `Window` frame.
    unacked: u32,
    read_eof: bool,
    reset: bool,
    write_closed: bool,
    /// Closed or reset locally; nothing left to do on drop.
    finished: bool,
}

impl Stream {
    /// Register stream `id` on `conn`.
    pub(crate) fn new(id: u32, protocol: String, conn: Arc<ConnectionShared>) -> Self {
        let (state, events) = conn.register(id);
        Self {
            id,
            protocol,
            conn,
            state,
            events,
            pending: Bytes::new(),
            unacked: 0,
            read_eof: false,
            reset: false,
            write_closed: false,
            finished: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The negotiated protocol name.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> &PeerId {
        self.conn.remote_peer()
    }

    /// Write all of `data`, split into frames of at most [`MAX_PAYLOAD`] bytes.
    ///
    /// Waits while the remote's receive window is full.
    pub async fn write_all(&mut self, data: &[u8]) -> WireResult<()> {
        if self.reset || self.state.is_reset() {
            return Err(WireError::StreamReset);
        }
        if self.write_closed || self.finished {
            return Err(WireError::StreamClosed);
        }
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.state.reserve(rest.len().min(MAX_PAYLOAD)).await?;
            let (chunk, tail) = rest.split_at(n);
            self.conn
                .send(Frame::new(
                    FrameKind::Data,
                    self.id,
                    Bytes::copy_from_slice(chunk),
                ))
                .await?;
            rest = tail;
        }
        Ok(())
    }

    /// Half-close: tell the remote we will write no more. Reading continues.
    pub async fn close_write(&mut self) -> WireResult<()> {
        if self.reset {
            return Err(WireError::StreamReset);
        }
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        self.conn
            .send(Frame::control(FrameKind::Close, self.id))
            .await
    }

    /// Graceful close: flush, send FIN, release the stream.
    pub async fn close(mut self) -> WireResult<()> {
        let result = self.close_write().await;
        self.release();
        result
    }

    /// Abort the stream; the remote's reads fail.
    pub async fn reset(mut self) {
        if !self.reset {
            // Best effort: the connection may already be gone.
            let _ = self.conn.send_control(Frame::control(FrameKind::Reset, self.id));
        }
        self.release();
    }

    /// Wait for the remote to accept or refuse our `Open`.
    pub(crate) async fn await_accept(&mut self) -> WireResult<()> {
        match self.events.recv().await {
            Some(StreamEvent::Accepted) => Ok(()),
            Some(StreamEvent::Reset) => {
                self.reset = true;
                self.release();
                Err(WireError::ProtocolNegotiation {
                    protocol: self.protocol.clone(),
                })
            }
            Some(other) => Err(WireError::InvalidFrame(format!(
                "expected Ack on stream {}, got {other:?}",
                self.id
            ))),
            None => {
                self.reset = true;
                self.release();
                Err(WireError::ConnectionClosed)
            }
        }
    }

    fn release(&mut self) {
        if !self.finished {
            self.finished = true;
            self.conn.unregister(self.id);
        }
    }

    /// Fill `pending` with the next chunk. Ready with an empty buffer at EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() || self.read_eof {
                return Poll::Ready(Ok(()));
            }
            if self.reset {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    WireError::StreamReset,
                )));
            }
            match ready!(self.events.poll_recv(cx)) {
                Some(StreamEvent::Data(bytes)) => self.pending = bytes,
                Some(StreamEvent::Eof) => self.read_eof = true,
                Some(StreamEvent::Reset) | None => self.reset = true,
                Some(StreamEvent::Accepted) => {}
            }
        }
    }

    /// Drop `n` read bytes and return credit once enough has accumulated.
    fn mark_read(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.pending.advance(n);
        self.state.consumed(n);
        self.unacked = self.unacked.saturating_add(n as u32);
        if self.unacked < WINDOW_UPDATE_THRESHOLD || self.read_eof || self.reset || self.finished {
            return;
        }
        match self.conn.send_control(Frame::window(self.id, self.unacked)) {
            Ok(()) => self.unacked = 0,
            Err(e) => debug!(stream = self.id, error = %e, "window update deferred"),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_fill(cx))?;
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.mark_read(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncBufRead for Stream {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        ready!(this.poll_fill(cx))?;
        Poll::Ready(Ok(&this.pending[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().mark_read(amt);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(
            stream = self.id,
            protocol = %self.protocol,
            "stream dropped without close, resetting"
        );
        if !self.reset {
            if let Err(e) = self.conn.send_control(Frame::control(FrameKind::Reset, self.id)) {
                debug!(stream = self.id, error = %e, "reset for dropped stream not sent");
            }
        }
        self.release();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote", self.conn.remote_peer())
            .field("write_closed", &self.write_closed)
            .field("reset", &self.reset)
            .finish()
    }
}

/// Read one `\n`-terminated line, newline included.
///
/// Suspends until the delimiter arrives. End of stream or a reset before the
/// delimiter yields [`WireError::IncompleteMessage`]; more than
/// [`MAX_LINE_LEN`] bytes without one yields [`WireError::MessageTooLarge`].
pub async fn read_line<R>(reader: &mut R) -> WireResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_LINE_LEN as u64 + 1);
    match limited.read_until(b'\n', &mut line).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            return Err(WireError::IncompleteMessage)
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    if line.last() == Some(&b'\n') {
        Ok(line)
    } else if line.len() > MAX_LINE_LEN {
        Err(WireError::MessageTooLarge {
            size: line.len(),
            max: MAX_LINE_LEN,
        })
    } else {
        Err(WireError::IncompleteMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbound, Outbox};
    use crate::handshake::Role;
    use crate::identity::Keypair;
    use std::time::Duration;
    use tokio::io::BufReader;

    fn test_stream() -> (Stream, Arc<ConnectionShared>, Outbox) {
        let remote = Keypair::generate(None).unwrap().peer_id();
        let (conn, outbox) = ConnectionShared::new(remote, Role::Dialer);
        let stream = Stream::new(conn.next_stream_id(), "/echo/1.0.0".to_string(), Arc::clone(&conn));
        (stream, conn, outbox)
    }

    /// Next frame on the data lane.
    fn expect_frame(outbox: &mut Outbox) -> Frame {
        match outbox.frames.try_recv() {
            Ok(frame) => frame,
            Err(e) => panic!("no frame queued: {e}"),
        }
    }

    fn expect_control(outbox: &mut Outbox) -> Frame {
        match outbox.control.try_recv() {
            Ok(Outbound::Frame(frame)) => frame,
            Ok(Outbound::Close) => panic!("unexpected close"),
            Err(e) => panic!("no control frame queued: {e}"),
        }
    }

    #[tokio::test]
    async fn test_read_line_from_slice() {
        let mut input: &[u8] = b"ping\nrest";
        assert_eq!(read_line(&mut input).await.unwrap(), b"ping\n");
        assert_eq!(input, b"rest");
    }

    #[tokio::test]
    async fn test_read_line_across_chunks() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Hello, ")
            .read(b"world!\n")
            .build();
        let mut reader = BufReader::new(mock);
        assert_eq!(read_line(&mut reader).await.unwrap(), b"Hello, world!\n");
    }

    #[tokio::test]
    async fn test_read_line_eof_before_newline() {
        let mut input: &[u8] = b"ping";
        assert!(matches!(
            read_line(&mut input).await,
            Err(WireError::IncompleteMessage)
        ));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let mut reader = BufReader::new(tokio::io::repeat(b'a'));
        match read_line(&mut reader).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(max, MAX_LINE_LEN);
                assert_eq!(size, MAX_LINE_LEN + 1);
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_reads_data_then_eof() {
        let (mut stream, conn, _outbox) = test_stream();
        conn.deliver(stream.id(), StreamEvent::Data(Bytes::from_static(b"pi")))
            .unwrap();
        conn.deliver(stream.id(), StreamEvent::Data(Bytes::from_static(b"ng\n")))
            .unwrap();
        conn.deliver(stream.id(), StreamEvent::Eof).unwrap();

        assert_eq!(read_line(&mut stream).await.unwrap(), b"ping\n");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_reset_before_newline_is_incomplete() {
        let (mut stream, conn, _outbox) = test_stream();
        conn.deliver(stream.id(), StreamEvent::Data(Bytes::from_static(b"pi")))
            .unwrap();
        conn.deliver(stream.id(), StreamEvent::Reset).unwrap();
        assert!(matches!(
            read_line(&mut stream).await,
            Err(WireError::IncompleteMessage)
        ));

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(matches!(
            stream.write_all(b"x").await,
            Err(WireError::StreamReset)
        ));
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (mut stream, _conn, mut outbox) = test_stream();
        stream.state.grant(MAX_PAYLOAD as u32);
        let data = vec![7u8; MAX_PAYLOAD + 10];
        stream.write_all(&data).await.unwrap();

        let first = expect_frame(&mut outbox);
        let second = expect_frame(&mut outbox);
        assert_eq!(first.kind, FrameKind::Data);
        assert_eq!(first.payload.len(), MAX_PAYLOAD);
        assert_eq!(second.payload.len(), 10);
        assert_eq!(first.stream_id, stream.id());
    }

    #[tokio::test]
    async fn test_write_waits_for_window_credit() {
        let (mut stream, conn, mut outbox) = test_stream();
        let id = stream.id();
        let data = vec![1u8; STREAM_WINDOW as usize + 10];
        let writer = tokio::spawn(async move { stream.write_all(&data).await.map(|()| stream) });

        let first = outbox.frames.recv().await.unwrap();
        assert_eq!(first.payload.len(), STREAM_WINDOW as usize);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "writer must wait for credit");
        assert!(outbox.frames.try_recv().is_err());

        conn.grant(id, 10);
        let second = outbox.frames.recv().await.unwrap();
        assert_eq!(second.payload.len(), 10);
        writer.await.unwrap().unwrap().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_wakes_writer_waiting_for_credit() {
        let (mut stream, conn, mut outbox) = test_stream();
        let id = stream.id();
        let data = vec![1u8; STREAM_WINDOW as usize + 1];
        let writer = tokio::spawn(async move { stream.write_all(&data).await });

        outbox.frames.recv().await.unwrap();
        conn.deliver(id, StreamEvent::Reset).unwrap();
        assert!(matches!(writer.await.unwrap(), Err(WireError::StreamReset)));
    }

    #[tokio::test]
    async fn test_reading_returns_window_credit() {
        let (mut stream, conn, mut outbox) = test_stream();
        let half = WINDOW_UPDATE_THRESHOLD as usize;
        conn.deliver(stream.id(), StreamEvent::Data(Bytes::from(vec![2u8; half - 1])))
            .unwrap();
        conn.deliver(stream.id(), StreamEvent::Data(Bytes::from_static(b"z\n")))
            .unwrap();

        let mut buf = vec![0u8; half - 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert!(outbox.control.try_recv().is_err(), "no credit below the threshold");

        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        let update = expect_control(&mut outbox);
        assert_eq!(update.kind, FrameKind::Window);
        assert_eq!(update.credit(), Some(WINDOW_UPDATE_THRESHOLD));
        assert_eq!(stream.state.buffered.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_close_write_then_write_fails() {
        let (mut stream, _conn, mut outbox) = test_stream();
        stream.close_write().await.unwrap();
        assert_eq!(expect_frame(&mut outbox).kind, FrameKind::Close);
        assert!(matches!(
            stream.write_all(b"late").await,
            Err(WireError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unregisters_without_reset() {
        let (stream, conn, mut outbox) = test_stream();
        assert_eq!(conn.stream_count(), 1);

        stream.close().await.unwrap();
        assert_eq!(expect_frame(&mut outbox).kind, FrameKind::Close);
        assert!(outbox.control.try_recv().is_err(), "close must not also reset");
        assert_eq!(conn.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_resets_stream() {
        let (stream, conn, mut outbox) = test_stream();
        let id = stream.id();
        drop(stream);

        let frame = expect_control(&mut outbox);
        assert_eq!(frame.kind, FrameKind::Reset);
        assert_eq!(frame.stream_id, id);
        assert_eq!(conn.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_with_stalled_control_lane_still_releases() {
        let (stream, conn, _outbox) = test_stream();
        while conn.send_control(Frame::control(FrameKind::Reset, 99)).is_ok() {}
        drop(stream);
        assert_eq!(conn.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_open_is_negotiation_error() {
        let (mut stream, conn, _outbox) = test_stream();
        conn.deliver(stream.id(), StreamEvent::Reset).unwrap();
        match stream.await_accept().await {
            Err(WireError::ProtocolNegotiation { protocol }) => assert_eq!(protocol, "/echo/1.0.0"),
            other => panic!("expected ProtocolNegotiation, got {other:?}"),
        }
    }
}
