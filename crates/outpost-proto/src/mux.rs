//! Stream multiplexing over a single byte transport (protocol V2).
//!
//! Frame format: `0x02 | stream_id(4) | frame_type(1) | flags(1) | length(4) |
//! payload`, integers big-endian. The opener announces a stream with `Open`,
//! ships bytes in `Data` frames and half-closes with `Close`+FIN; a `Close`
//! with RST stands in for an abandoned stream. Client-opened streams carry odd
//! IDs so both sides can allocate without coordination.
//!
//! Inbound bytes are routed to per-stream unbounded buffers, so a slow reader
//! on one stream never stalls its siblings; the cost is memory proportional to
//! how far the remote producer runs ahead.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frame::VERSION_MUX;

/// Largest accepted frame payload.
const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Data writes are chunked so one large write cannot monopolize the session.
const WRITE_CHUNK: usize = 64 * 1024;

/// Outbound frame queue depth shared by all streams of a session.
const OUT_QUEUE: usize = 64;

/// Queue depth for not-yet-accepted inbound streams.
const ACCEPT_QUEUE: usize = 16;

const FLAG_FIN: u8 = 0x01;
const FLAG_RST: u8 = 0x04;

/// Session errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("mux session closed")]
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Open = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = std::io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Open),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Close),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown mux frame type {other}"),
            )),
        }
    }
}

#[derive(Debug)]
struct MuxFrame {
    stream_id: u32,
    kind: FrameKind,
    flags: u8,
    payload: Bytes,
}

impl MuxFrame {
    fn open(stream_id: u32) -> Self {
        Self { stream_id, kind: FrameKind::Open, flags: 0, payload: Bytes::new() }
    }

    fn data(stream_id: u32, payload: Bytes) -> Self {
        Self { stream_id, kind: FrameKind::Data, flags: 0, payload }
    }

    fn fin(stream_id: u32) -> Self {
        Self { stream_id, kind: FrameKind::Close, flags: FLAG_FIN, payload: Bytes::new() }
    }

    fn rst(stream_id: u32) -> Self {
        Self { stream_id, kind: FrameKind::Close, flags: FLAG_RST, payload: Bytes::new() }
    }
}

struct Shared {
    /// Inbound routing table: stream id -> that stream's buffer. Dropping a
    /// sender is how EOF reaches the reader.
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    out_tx: mpsc::Sender<MuxFrame>,
    cancel: CancellationToken,
    next_stream_id: AtomicU32,
}

impl Shared {
    fn stream_table(&self) -> std::sync::MutexGuard<'_, HashMap<u32, mpsc::UnboundedSender<Bytes>>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A multiplexing session over one transport.
///
/// Owns the accept side; cheap [`MuxHandle`]s open streams from other tasks.
pub struct MuxSession {
    shared: Arc<Shared>,
    incoming: mpsc::Receiver<MuxStream>,
}

/// Clonable opener handle for a [`MuxSession`].
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxSession {
    /// Start the client side of a session. Client streams use odd IDs.
    pub fn client<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, 1, false)
    }

    /// Start the server side of a session.
    ///
    /// The server discovers the upgrade by reading the first frame's version
    /// byte during the handshake, so the read loop must not expect it again.
    pub fn server<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, 2, true)
    }

    fn start<S>(io: S, first_id: u32, lead_consumed: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE);
        let (in_tx, incoming) = mpsc::channel(ACCEPT_QUEUE);

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            out_tx,
            cancel: CancellationToken::new(),
            next_stream_id: AtomicU32::new(first_id),
        });

        let (r, w) = tokio::io::split(io);
        tokio::spawn(read_loop(r, shared.clone(), in_tx, lead_consumed));
        tokio::spawn(write_loop(w, out_rx, shared.cancel.clone()));

        Self { shared, incoming }
    }

    /// Accept the next remotely opened stream. `None` once the session is
    /// closed.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        tokio::select! {
            stream = self.incoming.recv() => stream,
            _ = self.shared.cancel.cancelled() => None,
        }
    }

    pub fn handle(&self) -> MuxHandle {
        MuxHandle { shared: self.shared.clone() }
    }

    /// Open a new local stream.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        self.handle().open_stream().await
    }

    /// Tear the session down; all streams see EOF and the transport tasks
    /// exit.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Token cancelled when the session dies for any reason.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        // A session abandoned mid-handshake (or anywhere else) must not leave
        // its transport tasks running.
        self.shared.cancel.cancel();
    }
}

impl MuxHandle {
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = register_stream(&self.shared, id);

        self.shared
            .out_tx
            .send(MuxFrame::open(id))
            .await
            .map_err(|_| MuxError::SessionClosed)?;

        Ok(stream)
    }

    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

fn register_stream(shared: &Arc<Shared>, id: u32) -> MuxStream {
    let (tx, rx) = mpsc::unbounded_channel();
    shared.stream_table().insert(id, tx);

    MuxStream {
        id,
        shared: shared.clone(),
        rx,
        read_buf: Bytes::new(),
        pending_send: None,
        write_closed: false,
    }
}

async fn read_loop<R>(
    mut r: R,
    shared: Arc<Shared>,
    in_tx: mpsc::Sender<MuxStream>,
    mut lead_consumed: bool,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            res = read_frame(&mut r, lead_consumed) => match res {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "mux transport read ended");
                    break;
                }
            },
            _ = shared.cancel.cancelled() => break,
        };
        lead_consumed = false;

        match frame.kind {
            FrameKind::Open => {
                let stream = register_stream(&shared, frame.stream_id);
                if in_tx.send(stream).await.is_err() {
                    break;
                }
            }
            FrameKind::Data => {
                let tx = shared.stream_table().get(&frame.stream_id).cloned();

                match tx {
                    Some(tx) => {
                        let _ = tx.send(frame.payload);
                    }
                    None => trace!(stream_id = frame.stream_id, "data for unknown stream"),
                }
            }
            FrameKind::Close => {
                // FIN and RST both end the read side; draining buffered data
                // before EOF is the unbounded channel's job.
                shared.stream_table().remove(&frame.stream_id);
            }
        }
    }

    shared.cancel.cancel();
    shared.stream_table().clear();
}

async fn write_loop<W>(mut w: W, mut rx: mpsc::Receiver<MuxFrame>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        if let Err(e) = write_frame(&mut w, &frame).await {
            debug!(error = %e, "mux transport write ended");
            break;
        }
    }

    cancel.cancel();
    let _ = w.shutdown().await;
}

async fn read_frame<R>(r: &mut R, skip_version: bool) -> std::io::Result<MuxFrame>
where
    R: AsyncRead + Unpin,
{
    if !skip_version {
        let version = r.read_u8().await?;
        if version != VERSION_MUX {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected mux frame version {version:#04x}"),
            ));
        }
    }

    let stream_id = r.read_u32().await?;
    let kind = FrameKind::try_from(r.read_u8().await?)?;
    let flags = r.read_u8().await?;

    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("mux frame of {len} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;

    Ok(MuxFrame { stream_id, kind, flags, payload: payload.into() })
}

async fn write_frame<W>(w: &mut W, frame: &MuxFrame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(VERSION_MUX).await?;
    w.write_u32(frame.stream_id).await?;
    w.write_u8(frame.kind as u8).await?;
    w.write_u8(frame.flags).await?;
    w.write_u32(frame.payload.len() as u32).await?;
    w.write_all(&frame.payload).await?;
    w.flush().await?;

    Ok(())
}

type SendFuture = Pin<Box<dyn Future<Output = Result<(), MuxError>> + Send>>;

/// One multiplexed byte stream.
///
/// Reads drain this stream's inbound buffer; writes enqueue `Data` frames on
/// the shared session writer. `shutdown` sends FIN (write-side half-close,
/// reads stay usable); dropping without shutdown sends RST.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    read_buf: Bytes,
    /// In-flight frame enqueue: (bytes it accounts for, future). The length
    /// is reported to the caller only once the future completes, so a frame
    /// is never enqueued twice for the same bytes.
    pending_send: Option<(usize, SendFuture)>,
    write_closed: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn enqueue(&self, frame: MuxFrame) -> SendFuture {
        let tx = self.shared.out_tx.clone();
        Box::pin(async move { tx.send(frame).await.map_err(|_| MuxError::SessionClosed) })
    }

    fn drive_pending(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        if let Some((len, fut)) = self.pending_send.as_mut() {
            let len = *len;
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.pending_send = None;
                    Poll::Ready(Ok(len))
                }
                Poll::Ready(Err(_)) => {
                    self.pending_send = None;
                    Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "mux session closed",
                    )))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Ok(0))
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            // Sender gone: remote FIN/RST or session teardown. EOF either way.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Ready(Some(chunk)) => {
                self.read_buf = chunk;
                self.poll_read(cx, buf)
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mux stream write side closed",
            )));
        }

        // An in-flight enqueue accounts for a prefix of `data`; report it as
        // written once it lands.
        if self.pending_send.is_some() {
            return self.drive_pending(cx);
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let len = data.len().min(WRITE_CHUNK);
        let frame = MuxFrame::data(self.id, Bytes::copy_from_slice(&data[..len]));
        let fut = self.enqueue(frame);
        self.pending_send = Some((len, fut));

        self.drive_pending(cx)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.drive_pending(cx) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.write_closed && self.pending_send.is_none() {
            return Poll::Ready(Ok(()));
        }

        if !self.write_closed {
            match self.drive_pending(cx) {
                Poll::Ready(Ok(_)) => {}
                // Session gone: the peer cannot see a FIN anyway.
                Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }

            self.write_closed = true;
            let fut = self.enqueue(MuxFrame::fin(self.id));
            self.pending_send = Some((0, fut));
        }

        match self.drive_pending(cx) {
            Poll::Ready(_) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.stream_table().remove(&self.id);

        if !self.write_closed {
            let _ = self.shared.out_tx.try_send(MuxFrame::rst(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Build a connected client/server session pair, consuming the client's
    /// first version byte the way the real handshake sniff does.
    async fn session_pair() -> (MuxSession, MuxSession) {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(a);

        // Force a first frame so the lead byte is on the wire, then strip it.
        let probe = client.open_stream().await.unwrap();
        let lead = b.read_u8().await.unwrap();
        assert_eq!(lead, VERSION_MUX);

        let mut server = MuxSession::server(b);
        let _probe_in = server.accept().await.unwrap();
        drop(probe);

        (client, server)
    }

    #[tokio::test]
    async fn open_accept_and_exchange() {
        let (client, mut server) = session_pair().await;

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"hello").await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn shutdown_delivers_eof_but_keeps_reads() {
        let (client, mut server) = session_pair().await;

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"request").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"request");

        // The half-closed side still reads the response.
        inbound.write_all(b"response").await.unwrap();
        inbound.shutdown().await.unwrap();

        let mut buf = Vec::new();
        out.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"response");
    }

    #[tokio::test]
    async fn drop_resets_the_peer() {
        let (client, mut server) = session_pair().await;

        let out = client.open_stream().await.unwrap();
        let mut inbound = server.accept().await.unwrap();

        drop(out);

        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (client, mut server) = session_pair().await;

        let mut slow = client.open_stream().await.unwrap();
        let mut fast = client.open_stream().await.unwrap();
        assert_ne!(slow.id(), fast.id());

        let mut slow_in = server.accept().await.unwrap();
        let mut fast_in = server.accept().await.unwrap();

        // Fill the slow stream without anyone reading it...
        for _ in 0..32 {
            slow.write_all(&[0u8; 1024]).await.unwrap();
        }

        // ...and the fast stream still round-trips promptly.
        fast.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        fast_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let mut drained = vec![0u8; 1024];
        slow_in.read_exact(&mut drained).await.unwrap();
    }

    #[tokio::test]
    async fn session_close_ends_streams() {
        let (client, mut server) = session_pair().await;

        let mut out = client.open_stream().await.unwrap();
        let _inbound = server.accept().await.unwrap();

        client.close();

        let mut buf = Vec::new();
        // EOF, not a hang.
        let n = out.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
