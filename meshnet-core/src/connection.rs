use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use meshnet_identity::PeerId;
use meshnet_multiaddr::Multiaddr;

/// The direction in which a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A bidirectional byte pipe produced by a [`crate::transport::Transport`],
/// not yet secured or muxed.
pub trait RawConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn remote_address(&self) -> &Multiaddr;
    fn local_address(&self) -> Option<&Multiaddr>;
}

/// A byte pipe that additionally exposes the verified remote identity.
pub trait SecuredConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn remote_peer(&self) -> PeerId;
    fn local_peer(&self) -> PeerId;
    fn security_protocol(&self) -> &'static str;
}

/// An event a [`MuxedConnection`] can report out-of-band from its stream
/// traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerEvent {
    /// The remote closed the whole connection.
    Closed,
}

/// A single logical, independently half-closable stream multiplexed over a
/// [`MuxedConnection`]. Every stream belongs to exactly one connection;
/// closing the connection terminates all of its streams.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn id(&self) -> u64;
}

/// A type-erased, heap-boxed [`Stream`], the shape every upper layer
/// actually hands around once a connection has been negotiated.
pub type BoxStream = Box<dyn Stream>;

impl Stream for BoxStream {
    fn id(&self) -> u64 {
        (**self).id()
    }
}

/// Opens and accepts logical streams over a single secured connection.
#[async_trait]
pub trait MuxedConnection: Send + 'static {
    fn remote_peer(&self) -> PeerId;
    fn local_peer(&self) -> PeerId;

    async fn open_stream(&mut self) -> std::io::Result<BoxStream>;
    async fn accept_stream(&mut self) -> std::io::Result<BoxStream>;

    /// Begins an orderly close; terminates every open stream.
    async fn close(&mut self) -> std::io::Result<()>;
}

/// A type-erased, heap-boxed [`MuxedConnection`].
pub type BoxMuxedConnection = Box<dyn MuxedConnection>;

/// Prepends multistream-select's leftover buffered bytes onto a muxed
/// stream's reads, the same way [`crate::upgrade`]'s internal `WithPrefix`
/// does for the upgrade pipeline's raw/secured connections.
pub struct BufferedMuxedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxStream,
}

impl BufferedMuxedStream {
    fn new(prefix: Vec<u8>, inner: BoxStream) -> Self {
        BufferedMuxedStream { prefix, pos: 0, inner }
    }

    /// Wraps `stream` only if `remainder` is non-empty; otherwise returns
    /// it unchanged so the common case (no piggybacked bytes) adds no
    /// indirection.
    pub fn wrap(remainder: Vec<u8>, stream: BoxStream) -> BoxStream {
        if remainder.is_empty() {
            stream
        } else {
            Box::new(BufferedMuxedStream::new(remainder, stream))
        }
    }
}

impl AsyncRead for BufferedMuxedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = std::cmp::min(buf.len(), this.prefix.len() - this.pos);
            buf[..n].copy_from_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedMuxedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

impl Stream for BufferedMuxedStream {
    fn id(&self) -> u64 {
        self.inner.id()
    }
}
