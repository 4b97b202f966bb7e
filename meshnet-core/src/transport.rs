//! Transport capability traits, and a minimal in-memory transport used to
//! exercise the upgrade pipeline and Node orchestrator without a real
//! TCP/QUIC stack (those remain collaborator interfaces per the design's
//! scope — see `SPEC_FULL.md`).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use meshnet_identity::PeerId;
use meshnet_multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::connection::{BoxMuxedConnection, RawConnection};

const DUPLEX_BUFFER: usize = 64 * 1024;

/// A byte-pipe transport that produces [`RawConnection`]s; security and
/// muxing are layered on top by the upgrade pipeline.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn can_dial(&self, addr: &Multiaddr) -> bool;
    async fn dial(&self, addr: &Multiaddr) -> std::io::Result<Box<dyn RawConnection>>;
    async fn listen(&self, addr: &Multiaddr) -> std::io::Result<(Multiaddr, Box<dyn Listener>)>;
}

/// A transport whose connections come out already secured and muxed (the
/// QUIC-class case in §4.10): the upgrade pipeline is skipped entirely.
#[async_trait]
pub trait SecuredTransport: Send + Sync + 'static {
    fn can_dial(&self, addr: &Multiaddr) -> bool;
    async fn dial_secured(
        &self,
        addr: &Multiaddr,
        expected_peer: Option<PeerId>,
    ) -> std::io::Result<BoxMuxedConnection>;
    async fn listen_secured(
        &self,
        addr: &Multiaddr,
    ) -> std::io::Result<(Multiaddr, Box<dyn SecuredListener>)>;
}

#[async_trait]
pub trait Listener: Send + 'static {
    async fn accept(&mut self) -> std::io::Result<Box<dyn RawConnection>>;
}

#[async_trait]
pub trait SecuredListener: Send + 'static {
    async fn accept(&mut self) -> std::io::Result<BoxMuxedConnection>;
}

struct PendingMemoryConnection {
    remote_addr: Multiaddr,
    io: Compat<DuplexStream>,
}

/// Shared address space every [`MemoryTransport`] instance in a test or
/// demo dials and listens through. Constructed explicitly by the caller —
/// there is no global registry, matching §9's "no globally mutable
/// singletons" design note.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<PendingMemoryConnection>>>>,
    next_ephemeral_id: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            inboxes: Arc::new(Mutex::new(HashMap::new())),
            next_ephemeral_id: Arc::new(AtomicU64::new(1_000_000)),
        }
    }
}

fn memory_id(addr: &Multiaddr) -> Option<u64> {
    addr.iter().find_map(|p| match p {
        Protocol::Memory(id) => Some(*id),
        _ => None,
    })
}

/// An in-memory transport addressed by `/memory/<id>`, for tests and demo
/// binaries that want a real `Transport` without opening a socket.
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_ephemeral_addr: Multiaddr,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        let id = network.next_ephemeral_id.fetch_add(1, Ordering::SeqCst);
        MemoryTransport {
            network,
            local_ephemeral_addr: Multiaddr::empty().with(Protocol::Memory(id)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        memory_id(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> std::io::Result<Box<dyn RawConnection>> {
        let id = memory_id(addr).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a memory address")
        })?;
        let sender = {
            let inboxes = self.network.inboxes.lock();
            inboxes.get(&id).cloned().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no listener")
            })?
        };

        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
        sender
            .send(PendingMemoryConnection {
                remote_addr: self.local_ephemeral_addr.clone(),
                io: theirs.compat(),
            })
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "listener gone")
            })?;

        Ok(Box::new(MemoryConnection {
            io: ours.compat(),
            remote: addr.clone(),
            local: Some(self.local_ephemeral_addr.clone()),
        }))
    }

    async fn listen(&self, addr: &Multiaddr) -> std::io::Result<(Multiaddr, Box<dyn Listener>)> {
        let requested = memory_id(addr);
        let id = requested.unwrap_or_else(|| {
            self.network.next_ephemeral_id.fetch_add(1, Ordering::SeqCst)
        });
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.inboxes.lock().insert(id, tx);
        let local = Multiaddr::empty().with(Protocol::Memory(id));
        Ok((
            local.clone(),
            Box::new(MemoryListener {
                local,
                receiver: rx,
            }),
        ))
    }
}

struct MemoryListener {
    local: Multiaddr,
    receiver: mpsc::UnboundedReceiver<PendingMemoryConnection>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> std::io::Result<Box<dyn RawConnection>> {
        let pending = self.receiver.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "listener closed")
        })?;
        Ok(Box::new(MemoryConnection {
            io: pending.io,
            remote: pending.remote_addr,
            local: Some(self.local.clone()),
        }))
    }
}

struct MemoryConnection {
    io: Compat<DuplexStream>,
    remote: Multiaddr,
    local: Option<Multiaddr>,
}

impl RawConnection for MemoryConnection {
    fn remote_address(&self) -> &Multiaddr {
        &self.remote
    }

    fn local_address(&self) -> Option<&Multiaddr> {
        self.local.as_ref()
    }
}

impl AsyncRead for MemoryConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_reaches_a_listener_on_the_same_network() {
        let network = MemoryNetwork::new();
        let server_transport = MemoryTransport::new(network.clone());
        let (listen_addr, mut listener) = server_transport
            .listen(&Multiaddr::empty().with(Protocol::Memory(42)))
            .await
            .unwrap();

        let client_transport = MemoryTransport::new(network);
        let dial = tokio::spawn(async move { client_transport.dial(&listen_addr).await });

        let accepted = listener.accept().await.unwrap();
        assert!(accepted.local_address().is_some());
        let dialed = dial.await.unwrap().unwrap();
        assert!(memory_id(dialed.remote_address()).is_some());
    }

    #[tokio::test]
    async fn dial_without_listener_is_refused() {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::new(network);
        let result = transport
            .dial(&Multiaddr::empty().with(Protocol::Memory(999)))
            .await;
        assert!(result.is_err());
    }
}
