//! VirtualSocket: a duplex endpoint that migrates between transports.
//!
//! A socket starts `Pending`, fed by the HTTPS control endpoint through two
//! one-slot channels. Once the SOCKS5 driver writes its success reply, the
//! socket waits for a raw TLS connection carrying the same [`ConnectionId`]
//! and switches to `Bound`, after which all I/O goes to that socket directly.
//!
//! The whole pending phase, from creation to binding, is bounded by the
//! registry's bind timeout. Pending I/O fails with `TimedOut` past it.
//!
//! ```text
//!  control handler                         SOCKS5 driver task
//!  ---------------                         ------------------
//!  SocketHandle::exchange ── incoming ──▶  VirtualSocket::poll_read
//!                         ◀── outgoing ──  VirtualSocket::poll_write
//!  find_bound_socket ──── bind(raw) ────▶  Backend::Bound { raw }
//! ```

use crate::{
    conn_id::ConnectionId,
    error::RegistryError,
    registry::ConnectionRegistry,
    socks5::protocol::{ReplyCode, Version},
    transport::RawStream,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::{mpsc, oneshot},
    time::{Instant, Sleep},
};
use tokio_util::sync::PollSender;
use tracing::debug;

/// Smallest SOCKS5 success reply: IPv4 bound address with the port cut short
pub const NEGOTIATION_REPLY_MIN: usize = 6;

/// Largest SOCKS5 success reply: IPv6 bound address (4 + 16 + 2)
pub const NEGOTIATION_REPLY_MAX: usize = 22;

/// is_negotiation_reply checks a payload for the SOCKS5 "succeeded" reply shape.
/// Both roles use it to decide when to leave the control endpoint.
pub fn is_negotiation_reply(payload: &[u8]) -> bool {
    (NEGOTIATION_REPLY_MIN..=NEGOTIATION_REPLY_MAX).contains(&payload.len())
        && payload[0] == Version::SOCKS5 as u8
        && payload[1] == ReplyCode::Succeeded as u8
}

/// A raw socket handed over to a pending VirtualSocket
struct BoundSocket {
    stream: RawStream,
    peer_addr: SocketAddr,
}

/// SocketHandle is the registry-side view of a VirtualSocket.
/// The control endpoint exchanges bytes through it and the raw-socket
/// matcher binds through it; it never touches the backend directly.
pub struct SocketHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    incoming: mpsc::Sender<Bytes>,
    outgoing: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    binder: Mutex<Option<oneshot::Sender<BoundSocket>>>,
    negotiated: AtomicBool,
}

impl SocketHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// remote_addr is the control endpoint caller's address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// is_negotiated reports whether the driver has written its success reply
    pub fn is_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire)
    }

    /// exchange hands `payload` to the socket and returns the next chunk the
    /// driver writes back. Waits at most `wait` for that chunk and returns an
    /// empty reply if the driver had nothing to say yet. A payload the driver
    /// does not take within `wait` fails with `Busy`. Exchanges on one socket
    /// are serialized.
    pub async fn exchange(&self, payload: Bytes, wait: Duration) -> Result<Bytes, RegistryError> {
        let mut outgoing = self.outgoing.lock().await;

        if !payload.is_empty() {
            match tokio::time::timeout(wait, self.incoming.send(payload)).await {
                Ok(Ok(())) => {}
                // The socket dropped its pending backend: closed or migrated
                Ok(Err(_)) => return Err(RegistryError::NotFound(self.id)),
                Err(_) => return Err(RegistryError::Busy(self.id)),
            }
        }

        match tokio::time::timeout(wait, outgoing.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(RegistryError::NotFound(self.id)),
            Err(_) => Ok(Bytes::new()),
        }
    }

    /// bind hands a raw socket to the VirtualSocket. Only the first call
    /// succeeds; later calls fail with `AlreadyBound` and leave it untouched.
    pub fn bind(&self, stream: RawStream, peer_addr: SocketAddr) -> Result<(), RegistryError> {
        let binder = self
            .binder
            .lock()
            .take()
            .ok_or(RegistryError::AlreadyBound(self.id))?;

        binder
            .send(BoundSocket { stream, peer_addr })
            .map_err(|_| RegistryError::NotFound(self.id))
    }
}

/// Backend is the active I/O path of a VirtualSocket
enum Backend {
    Pending {
        incoming: mpsc::Receiver<Bytes>,
        outgoing: PollSender<Bytes>,
        leftover: Bytes,
    },
    Bound {
        stream: RawStream,
        peer_addr: SocketAddr,
    },
}

/// VirtualSocket is owned by the task driving the SOCKS5 protocol
pub struct VirtualSocket {
    id: ConnectionId,
    handle: Arc<SocketHandle>,
    registry: ConnectionRegistry,
    backend: Backend,
    bind_rx: Option<oneshot::Receiver<BoundSocket>>,
    deadline: Instant,
    deadline_timer: Option<Pin<Box<Sleep>>>,
}

impl VirtualSocket {
    /// new builds a pending socket and the handle the registry keeps for it
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        registry: ConnectionRegistry,
        bind_timeout: Duration,
    ) -> (Self, Arc<SocketHandle>) {
        // One-slot buffers in each direction
        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(1);
        let (bind_tx, bind_rx) = oneshot::channel();

        let handle = Arc::new(SocketHandle {
            id,
            remote_addr,
            incoming: incoming_tx,
            outgoing: tokio::sync::Mutex::new(outgoing_rx),
            binder: Mutex::new(Some(bind_tx)),
            negotiated: AtomicBool::new(false),
        });

        let socket = Self {
            id,
            handle: handle.clone(),
            registry,
            backend: Backend::Pending {
                incoming: incoming_rx,
                outgoing: PollSender::new(outgoing_tx),
                leftover: Bytes::new(),
            },
            bind_rx: Some(bind_rx),
            deadline: Instant::now() + bind_timeout,
            deadline_timer: None,
        };

        (socket, handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.backend, Backend::Bound { .. })
    }

    pub fn is_negotiated(&self) -> bool {
        self.handle.is_negotiated()
    }

    /// peer_addr reports the control caller while pending and the raw
    /// socket's peer once bound
    pub fn peer_addr(&self) -> SocketAddr {
        match &self.backend {
            Backend::Pending { .. } => self.handle.remote_addr,
            Backend::Bound { peer_addr, .. } => *peer_addr,
        }
    }

    /// close deregisters the socket and shuts the raw socket down if bound
    pub async fn close(&mut self) -> io::Result<()> {
        self.registry.remove(&self.id);
        match &mut self.backend {
            Backend::Bound { stream, .. } => stream.shutdown().await,
            Backend::Pending { .. } => Ok(()),
        }
    }

    /// poll_deadline fails once the pending phase has outlived its deadline.
    /// The timer is armed on the first wait.
    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let deadline = self.deadline;
        let timer = self
            .deadline_timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        ready!(timer.as_mut().poll(cx));

        debug!(conn_id = %self.id, "virtual socket pending phase expired");
        Poll::Ready(io::Error::new(
            io::ErrorKind::TimedOut,
            "no raw socket arrived for virtual socket",
        ))
    }

    /// poll_bound waits for the raw socket once negotiation is done
    fn poll_bound(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.is_bound() {
            return Poll::Ready(Ok(()));
        }

        let Some(bind_rx) = self.bind_rx.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "virtual socket lost its raw socket",
            )));
        };

        match Pin::new(bind_rx).poll(cx) {
            Poll::Ready(Ok(bound)) => {
                debug!(conn_id = %self.id, peer = %bound.peer_addr, "virtual socket migrated to raw socket");
                self.bind_rx = None;
                self.deadline_timer = None;
                // Dropping the pending channels makes later exchanges fail
                self.backend = Backend::Bound {
                    stream: bound.stream,
                    peer_addr: bound.peer_addr,
                };
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.bind_rx = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "virtual socket abandoned before binding",
                )))
            }
            Poll::Pending => {
                let err = ready!(self.poll_deadline(cx));
                self.bind_rx = None;
                Poll::Ready(Err(err))
            }
        }
    }
}

impl AsyncRead for VirtualSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handle.is_negotiated() {
            ready!(this.poll_bound(cx))?;
        }

        let waiting = match &mut this.backend {
            Backend::Bound { stream, .. } => return Pin::new(stream).poll_read(cx, buf),
            Backend::Pending {
                incoming, leftover, ..
            } => loop {
                if !leftover.is_empty() {
                    let n = leftover.len().min(buf.remaining());
                    buf.put_slice(&leftover.split_to(n));
                    return Poll::Ready(Ok(()));
                }

                // Empty deliveries are skipped so a pending socket never
                // reports a false end-of-stream
                match incoming.poll_recv(cx) {
                    Poll::Ready(Some(chunk)) => *leftover = chunk,
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => break Poll::Pending,
                }
            },
        };

        // Nobody is feeding the socket: give up once the deadline passes
        match this.poll_deadline(cx) {
            Poll::Ready(err) => Poll::Ready(Err(err)),
            Poll::Pending => waiting,
        }
    }
}

impl AsyncWrite for VirtualSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.handle.is_negotiated() {
            ready!(this.poll_bound(cx))?;
        }

        match &mut this.backend {
            Backend::Bound { stream, .. } => Pin::new(stream).poll_write(cx, buf),
            Backend::Pending { outgoing, .. } => {
                let reserved = match outgoing.poll_reserve(cx) {
                    Poll::Ready(reserved) => reserved,
                    // Nobody is collecting replies
                    Poll::Pending => return this.poll_deadline(cx).map(Err),
                };
                reserved.map_err(|_| control_closed())?;

                if is_negotiation_reply(buf) {
                    debug!(conn_id = %this.id, "negotiation complete, awaiting raw socket");
                    this.handle.negotiated.store(true, Ordering::Release);
                }

                // Delivered unchanged, the marker only flips the flag
                outgoing
                    .send_item(Bytes::copy_from_slice(buf))
                    .map_err(|_| control_closed())?;
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().backend {
            Backend::Bound { stream, .. } => Pin::new(stream).poll_flush(cx),
            Backend::Pending { .. } => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().backend {
            Backend::Bound { stream, .. } => Pin::new(stream).poll_shutdown(cx),
            Backend::Pending { .. } => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

fn control_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "control endpoint closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    const SUCCESS_PREFIX: [u8; 2] = [0x05, 0x00];

    fn reply_of_len(len: usize) -> Vec<u8> {
        let mut reply = vec![0u8; len];
        reply[..2].copy_from_slice(&SUCCESS_PREFIX);
        reply
    }

    fn pending_socket() -> (ConnectionRegistry, VirtualSocket, Arc<SocketHandle>) {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let socket = registry
            .create(id, "10.0.0.7:4242".parse().unwrap())
            .unwrap();
        let handle = registry.lookup(&id).unwrap();
        (registry, socket, handle)
    }

    #[test]
    fn test_negotiation_marker_window() {
        assert!(is_negotiation_reply(&reply_of_len(8)));
        assert!(is_negotiation_reply(&reply_of_len(6)));
        assert!(is_negotiation_reply(&reply_of_len(22)));
        assert!(!is_negotiation_reply(&reply_of_len(5)));
        assert!(!is_negotiation_reply(&reply_of_len(23)));

        // Failure reply with a valid length
        let mut failure = reply_of_len(10);
        failure[1] = ReplyCode::ConnectionRefused as u8;
        assert!(!is_negotiation_reply(&failure));
    }

    #[tokio::test]
    async fn test_write_sets_flag_only_inside_window() {
        for (len, expected) in [(5, false), (8, true), (23, false)] {
            let (_registry, mut socket, handle) = pending_socket();

            let exchange = handle.exchange(Bytes::new(), Duration::from_secs(1));
            let reply_bytes = reply_of_len(len);
            let write = socket.write_all(&reply_bytes);
            let (reply, written) = tokio::join!(exchange, write);
            written.unwrap();

            // Bytes reach the peer unchanged either way
            assert_eq!(reply.unwrap().len(), len);
            assert_eq!(socket.is_negotiated(), expected, "len {len}");
        }
    }

    #[tokio::test]
    async fn test_pending_read_consumes_partial_chunks() {
        let (_registry, mut socket, handle) = pending_socket();

        let feeder = tokio::spawn(async move {
            // The socket writes nothing back, so the wait just elapses
            handle
                .exchange(Bytes::from_static(b"abcdef"), Duration::from_millis(50))
                .await
        });

        let mut first = [0u8; 4];
        socket.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"abcd");
        let mut rest = [0u8; 2];
        socket.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");

        assert_eq!(feeder.await.unwrap().unwrap(), Bytes::new());
    }

    #[tokio::test]
    async fn test_bind_is_exactly_once() {
        let (_registry, mut socket, handle) = pending_socket();
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();

        let (mut first_remote, first_local) = duplex(64);
        let (_second_remote, second_local) = duplex(64);

        handle.bind(Box::new(first_local), peer).unwrap();
        assert_eq!(
            handle.bind(Box::new(second_local), peer),
            Err(RegistryError::AlreadyBound(socket.id()))
        );

        // Finish negotiation, then traffic must flow over the first binding
        let exchange = handle.exchange(Bytes::new(), Duration::from_secs(1));
        let reply_bytes = reply_of_len(10);
        let write = socket.write_all(&reply_bytes);
        let (_, written) = tokio::join!(exchange, write);
        written.unwrap();

        socket.write_all(b"bulk").await.unwrap();
        let mut buf = [0u8; 4];
        first_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bulk");
        assert!(socket.is_bound());
        assert_eq!(socket.peer_addr(), peer);
    }

    #[tokio::test]
    async fn test_exchange_fails_after_migration() {
        let (_registry, mut socket, handle) = pending_socket();
        let (_remote, local) = duplex(64);

        let exchange = handle.exchange(Bytes::new(), Duration::from_secs(1));
        let reply_bytes = reply_of_len(10);
        let write = socket.write_all(&reply_bytes);
        let (_, written) = tokio::join!(exchange, write);
        written.unwrap();

        handle
            .bind(Box::new(local), "192.0.2.1:5000".parse().unwrap())
            .unwrap();
        socket.flush().await.unwrap();
        // Any I/O after negotiation completes the switch
        socket.write_all(b"x").await.unwrap();

        let res = handle
            .exchange(Bytes::from_static(b"late"), Duration::from_millis(50))
            .await;
        assert_eq!(res, Err(RegistryError::NotFound(socket.id())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_timeout() {
        let (registry, socket, handle) = pending_socket();
        let mut socket = socket;

        let exchange = handle.exchange(Bytes::new(), Duration::from_secs(1));
        let reply_bytes = reply_of_len(10);
        let write = socket.write_all(&reply_bytes);
        let (_, written) = tokio::join!(exchange, write);
        written.unwrap();

        let mut buf = [0u8; 1];
        let err = socket.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        drop(socket);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_fails_when_driver_stops_reading() {
        let (_registry, socket, handle) = pending_socket();
        let wait = Duration::from_millis(50);

        // The first payload fills the one-slot buffer, nothing comes back
        let reply = handle.exchange(Bytes::from_static(b"first"), wait).await;
        assert_eq!(reply, Ok(Bytes::new()));

        let res = handle.exchange(Bytes::from_static(b"second"), wait).await;
        assert_eq!(res, Err(RegistryError::Busy(socket.id())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfed_pending_socket_expires() {
        let (registry, mut socket, _handle) = pending_socket();

        // Never negotiated and never fed by an exchange
        let started = Instant::now();
        let mut buf = [0u8; 1];
        let err = socket.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= crate::registry::DEFAULT_BIND_TIMEOUT);

        drop(socket);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_peer_addr_while_pending() {
        let (_registry, socket, _handle) = pending_socket();
        assert_eq!(socket.peer_addr(), "10.0.0.7:4242".parse().unwrap());
    }

    #[tokio::test]
    async fn test_close_deregisters() {
        let (registry, mut socket, _handle) = pending_socket();
        assert_eq!(registry.len(), 1);
        socket.close().await.unwrap();
        assert!(registry.is_empty());
        // Removal stays idempotent when the socket is dropped afterwards
        drop(socket);
        assert!(registry.is_empty());
    }
}
