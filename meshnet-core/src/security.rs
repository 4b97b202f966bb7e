//! The security-upgrade seam the upgrade pipeline negotiates into. Real
//! deployments plug in Noise or TLS 1.3 (collaborator interfaces); this
//! module additionally carries a toy XOR-keyed upgrader used by the crate's
//! own tests to exercise the pipeline end to end.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use meshnet_identity::{Keypair, PeerId, PublicKey};

use crate::connection::{RawConnection, SecuredConnection};

const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// Negotiates a secured channel over a raw byte pipe and verifies the
/// remote's identity in the process.
#[async_trait]
pub trait SecurityUpgrader: Send + Sync + 'static {
    fn protocol_id(&self) -> &'static str;

    /// Runs as the side that dialed the connection.
    async fn secure_outbound(
        &self,
        io: Box<dyn RawConnection>,
        remote_peer_hint: Option<PeerId>,
    ) -> std::io::Result<Box<dyn SecuredConnection>>;

    /// Runs as the side that accepted the connection.
    async fn secure_inbound(
        &self,
        io: Box<dyn RawConnection>,
    ) -> std::io::Result<Box<dyn SecuredConnection>>;
}

async fn write_handshake<S: AsyncWrite + Unpin>(
    io: &mut S,
    public_key: &PublicKey,
    signature: &[u8],
) -> std::io::Result<()> {
    io.write_all(&public_key.to_bytes()).await?;
    io.write_all(signature).await?;
    io.flush().await
}

async fn read_handshake<S: AsyncRead + Unpin>(
    io: &mut S,
) -> std::io::Result<(PublicKey, PeerId)> {
    let mut pub_bytes = [0u8; PUBLIC_KEY_LEN];
    io.read_exact(&mut pub_bytes).await?;
    let mut sig = [0u8; SIGNATURE_LEN];
    io.read_exact(&mut sig).await?;
    let public_key = PublicKey::from_bytes(&pub_bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if !public_key.verify(&pub_bytes, &sig) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "handshake signature did not verify",
        ));
    }
    Ok((public_key, public_key.to_peer_id()))
}

/// A symmetric XOR stream cipher keyed from both sides' public keys. Not
/// real confidentiality — a stand-in so the pipeline's "secured" stage has
/// something to do without pulling in Noise.
pub struct XorSecurityUpgrader {
    local_keypair: Keypair,
}

impl XorSecurityUpgrader {
    pub fn new(local_keypair: Keypair) -> Self {
        XorSecurityUpgrader { local_keypair }
    }
}

#[async_trait]
impl SecurityUpgrader for XorSecurityUpgrader {
    fn protocol_id(&self) -> &'static str {
        "/meshnet/xor-toy/1.0.0"
    }

    async fn secure_outbound(
        &self,
        mut io: Box<dyn RawConnection>,
        remote_peer_hint: Option<PeerId>,
    ) -> std::io::Result<Box<dyn SecuredConnection>> {
        let local_public = self.local_keypair.public();
        let sig = self.local_keypair.sign(&local_public.to_bytes());
        write_handshake(&mut io, &local_public, &sig).await?;
        let (remote_public, remote_peer) = read_handshake(&mut io).await?;
        if let Some(expected) = remote_peer_hint {
            if expected != remote_peer {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "remote presented an unexpected peer id",
                ));
            }
        }
        Ok(Box::new(XorSecuredConnection::new(
            io,
            local_public,
            remote_public,
            self.local_keypair.public().to_peer_id(),
            remote_peer,
        )))
    }

    async fn secure_inbound(
        &self,
        mut io: Box<dyn RawConnection>,
    ) -> std::io::Result<Box<dyn SecuredConnection>> {
        let (remote_public, remote_peer) = read_handshake(&mut io).await?;
        let local_public = self.local_keypair.public();
        let sig = self.local_keypair.sign(&local_public.to_bytes());
        write_handshake(&mut io, &local_public, &sig).await?;
        Ok(Box::new(XorSecuredConnection::new(
            io,
            local_public,
            remote_public,
            local_public.to_peer_id(),
            remote_peer,
        )))
    }
}

struct XorSecuredConnection {
    inner: Box<dyn RawConnection>,
    key: u8,
    local_peer: PeerId,
    remote_peer: PeerId,
}

impl XorSecuredConnection {
    fn new(
        inner: Box<dyn RawConnection>,
        local_public: PublicKey,
        remote_public: PublicKey,
        local_peer: PeerId,
        remote_peer: PeerId,
    ) -> Self {
        let key = local_public.to_bytes()[0] ^ remote_public.to_bytes()[0];
        XorSecuredConnection {
            inner,
            key,
            local_peer,
            remote_peer,
        }
    }
}

impl SecuredConnection for XorSecuredConnection {
    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn security_protocol(&self) -> &'static str {
        "/meshnet/xor-toy/1.0.0"
    }
}

impl AsyncRead for XorSecuredConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let key = this.key;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => {
                for byte in &mut buf[..n] {
                    *byte ^= key;
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl AsyncWrite for XorSecuredConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let masked: Vec<u8> = buf.iter().map(|b| b ^ this.key).collect();
        Pin::new(&mut this.inner).poll_write(cx, &masked)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport, Transport};
    use futures::{AsyncReadExt, AsyncWriteExt};
    use meshnet_multiaddr::{Multiaddr, Protocol};

    #[tokio::test]
    async fn xor_upgrade_agrees_on_peer_identities_and_transports_data() {
        let network = MemoryNetwork::new();
        let server_transport = MemoryTransport::new(network.clone());
        let (listen_addr, mut listener) = server_transport
            .listen(&Multiaddr::empty().with(Protocol::Memory(7)))
            .await
            .unwrap();

        let client_transport = MemoryTransport::new(network);
        let client_keypair = Keypair::generate();
        let client_peer = client_keypair.public().to_peer_id();
        let server_keypair = Keypair::generate();
        let server_peer = server_keypair.public().to_peer_id();

        let client_task = tokio::spawn(async move {
            let raw = client_transport.dial(&listen_addr).await.unwrap();
            let upgrader = XorSecurityUpgrader::new(client_keypair);
            let mut secured = upgrader.secure_outbound(raw, None).await.unwrap();
            secured.write_all(b"ping").await.unwrap();
            secured.flush().await.unwrap();
            secured.remote_peer()
        });

        let raw = listener.accept().await.unwrap();
        let upgrader = XorSecurityUpgrader::new(server_keypair);
        let mut secured = upgrader.secure_inbound(raw).await.unwrap();
        let mut buf = [0u8; 4];
        secured.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(secured.remote_peer(), client_peer);
        assert_eq!(secured.local_peer(), server_peer);

        let observed_server_peer = client_task.await.unwrap();
        assert_eq!(observed_server_peer, server_peer);
    }
}
