//! The upgrade pipeline: multistream-select negotiates a security
//! protocol, the chosen upgrader secures the channel and verifies the
//! remote's identity, multistream-select negotiates a muxer, and the
//! chosen muxer takes over. Bytes read past a negotiation boundary are
//! carried forward into the next layer rather than dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{AsyncRead, AsyncWrite};
use meshnet_identity::PeerId;
use meshnet_multistream_select::{dialer_select_proto, listener_select_proto, Version};

use crate::connection::{BoxMuxedConnection, RawConnection, SecuredConnection};
use crate::error::Error;
use crate::muxer::Muxer;
use crate::security::SecurityUpgrader;

/// The negotiable protocols an upgrade pipeline offers, and the framing
/// limit multistream-select enforces while negotiating them.
pub struct UpgradeConfig {
    pub security_upgraders: Vec<Arc<dyn SecurityUpgrader>>,
    pub muxers: Vec<Arc<dyn Muxer>>,
    pub max_message_size: usize,
}

/// Prepends bytes multistream-select already read off the wire onto
/// whatever the next layer reads, so negotiation never loses data that
/// arrived piggybacked with it.
struct WithPrefix<T> {
    prefix: Vec<u8>,
    pos: usize,
    inner: T,
}

impl<T> WithPrefix<T> {
    fn new(prefix: Vec<u8>, inner: T) -> Self {
        WithPrefix { prefix, pos: 0, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for WithPrefix<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
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

impl<T: AsyncWrite + Unpin> AsyncWrite for WithPrefix<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

impl RawConnection for WithPrefix<Box<dyn RawConnection>> {
    fn remote_address(&self) -> &meshnet_multiaddr::Multiaddr {
        self.inner.remote_address()
    }

    fn local_address(&self) -> Option<&meshnet_multiaddr::Multiaddr> {
        self.inner.local_address()
    }
}

impl SecuredConnection for WithPrefix<Box<dyn SecuredConnection>> {
    fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer()
    }

    fn local_peer(&self) -> PeerId {
        self.inner.local_peer()
    }

    fn security_protocol(&self) -> &'static str {
        self.inner.security_protocol()
    }
}

fn protocol_ids<T: ?Sized>(items: &[Arc<T>], id: impl Fn(&T) -> &'static str) -> Vec<String> {
    items.iter().map(|item| id(item).to_string()).collect()
}

async fn negotiate_security(
    config: &UpgradeConfig,
    raw: Box<dyn RawConnection>,
    outbound: bool,
) -> Result<Box<dyn SecuredConnection>, Error> {
    if config.security_upgraders.is_empty() {
        return Err(Error::NoSecurityUpgraders);
    }
    let ids = protocol_ids(&config.security_upgraders, |u| u.protocol_id());
    let negotiated = if outbound {
        dialer_select_proto(raw, &ids, Version::V1Lazy, config.max_message_size).await
    } else {
        listener_select_proto(raw, &ids, config.max_message_size).await
    }
    .map_err(|_| Error::ProtocolNegotiationFailed)?;

    let upgrader = config
        .security_upgraders
        .iter()
        .find(|u| u.protocol_id() == negotiated.protocol)
        .ok_or(Error::NoSecurityUpgraders)?;

    let prefixed: Box<dyn RawConnection> =
        Box::new(WithPrefix::new(negotiated.remainder, negotiated.stream));
    Ok(if outbound {
        upgrader.secure_outbound(prefixed, None).await?
    } else {
        upgrader.secure_inbound(prefixed).await?
    })
}

async fn negotiate_muxer(
    config: &UpgradeConfig,
    secured: Box<dyn SecuredConnection>,
    outbound: bool,
) -> Result<BoxMuxedConnection, Error> {
    if config.muxers.is_empty() {
        return Err(Error::NoMuxers);
    }
    let ids = protocol_ids(&config.muxers, |m| m.protocol_id());
    let negotiated = if outbound {
        dialer_select_proto(secured, &ids, Version::V1Lazy, config.max_message_size).await
    } else {
        listener_select_proto(secured, &ids, config.max_message_size).await
    }
    .map_err(|_| Error::ProtocolNegotiationFailed)?;

    let muxer = config
        .muxers
        .iter()
        .find(|m| m.protocol_id() == negotiated.protocol)
        .ok_or(Error::NoMuxers)?;

    let prefixed: Box<dyn SecuredConnection> =
        Box::new(WithPrefix::new(negotiated.remainder, negotiated.stream));
    Ok(muxer.upgrade(prefixed).await?)
}

/// Runs the dialer side: negotiate security, secure the channel, verify
/// the remote matches `expected_peer` if one was known in advance,
/// negotiate a muxer, and hand the result off to it.
pub async fn upgrade_outbound(
    config: &UpgradeConfig,
    raw: Box<dyn RawConnection>,
    expected_peer: Option<PeerId>,
) -> Result<BoxMuxedConnection, Error> {
    let secured = negotiate_security(config, raw, true).await?;
    if let Some(expected) = expected_peer {
        if secured.remote_peer() != expected {
            log::warn!(
                "dialed peer identified as {} but {expected} was expected",
                secured.remote_peer()
            );
            return Err(Error::PeerIdMismatch {
                expected,
                actual: secured.remote_peer(),
            });
        }
    }
    negotiate_muxer(config, secured, true).await
}

/// Runs the listener side: the remote's identity is only known once
/// security negotiation completes, so there is nothing to check it
/// against in advance.
pub async fn upgrade_inbound(
    config: &UpgradeConfig,
    raw: Box<dyn RawConnection>,
) -> Result<BoxMuxedConnection, Error> {
    let secured = negotiate_security(config, raw, false).await?;
    negotiate_muxer(config, secured, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::SimpleMuxer;
    use crate::security::XorSecurityUpgrader;
    use crate::transport::{MemoryNetwork, MemoryTransport, Transport};
    use futures::{AsyncReadExt, AsyncWriteExt};
    use meshnet_identity::Keypair;
    use meshnet_multiaddr::{Multiaddr, Protocol};

    fn config(keypair: Keypair) -> UpgradeConfig {
        UpgradeConfig {
            security_upgraders: vec![Arc::new(XorSecurityUpgrader::new(keypair))],
            muxers: vec![Arc::new(SimpleMuxer::default())],
            max_message_size: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn full_pipeline_agrees_on_peers_and_opens_streams() {
        let network = MemoryNetwork::new();
        let server_transport = MemoryTransport::new(network.clone());
        let (listen_addr, mut listener) = server_transport
            .listen(&Multiaddr::empty().with(Protocol::Memory(99)))
            .await
            .unwrap();
        let client_transport = MemoryTransport::new(network);

        let client_keypair = Keypair::generate();
        let client_peer = client_keypair.public().to_peer_id();
        let client_config = config(client_keypair);

        let client_task = tokio::spawn(async move {
            let raw = client_transport.dial(&listen_addr).await.unwrap();
            let mut muxed = upgrade_outbound(&client_config, raw, None).await.unwrap();
            let mut stream = muxed.open_stream().await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            stream.flush().await.unwrap();
            muxed.remote_peer()
        });

        let server_keypair = Keypair::generate();
        let server_peer = server_keypair.public().to_peer_id();
        let server_config = config(server_keypair);
        let raw = listener.accept().await.unwrap();
        let mut muxed = upgrade_inbound(&server_config, raw).await.unwrap();
        assert_eq!(muxed.local_peer(), server_peer);
        assert_eq!(muxed.remote_peer(), client_peer);

        let mut stream = muxed.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let observed_server_peer = client_task.await.unwrap();
        assert_eq!(observed_server_peer, server_peer);
    }

    #[tokio::test]
    async fn outbound_peer_mismatch_is_rejected() {
        let network = MemoryNetwork::new();
        let server_transport = MemoryTransport::new(network.clone());
        let (listen_addr, mut listener) = server_transport
            .listen(&Multiaddr::empty().with(Protocol::Memory(100)))
            .await
            .unwrap();
        let client_transport = MemoryTransport::new(network);

        let wrong_expectation = Keypair::generate().public().to_peer_id();
        let client_config = config(Keypair::generate());

        let client_task = tokio::spawn(async move {
            let raw = client_transport.dial(&listen_addr).await.unwrap();
            upgrade_outbound(&client_config, raw, Some(wrong_expectation)).await
        });

        let server_config = config(Keypair::generate());
        let raw = listener.accept().await.unwrap();
        // The listener side still completes; the dialer is the one that
        // catches the mismatch and aborts before the muxer negotiates.
        let _ = upgrade_inbound(&server_config, raw).await;

        let result = client_task.await.unwrap();
        assert!(matches!(result, Err(Error::PeerIdMismatch { .. })));
    }
}
