//! The stream-multiplexing seam. Real deployments plug in Yamux or mplex
//! (collaborator interfaces); this module also carries a toy length-framed
//! muxer used by the crate's own tests.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::io::WriteHalf;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use meshnet_identity::PeerId;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;

use crate::connection::{BoxMuxedConnection, BoxStream, MuxedConnection, SecuredConnection, Stream};

/// Negotiates a stream multiplexer over an already-secured connection.
#[async_trait]
pub trait Muxer: Send + Sync + 'static {
    fn protocol_id(&self) -> &'static str;
    async fn upgrade(
        &self,
        io: Box<dyn SecuredConnection>,
    ) -> std::io::Result<BoxMuxedConnection>;
}

const FRAME_DATA: u8 = 0;
const FRAME_FIN: u8 = 1;

fn encode_frame(id: u64, kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    meshnet_varint::encode_u64(id, &mut out);
    out.push(kind);
    meshnet_varint::encode_u64(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

async fn read_varint<R: AsyncRead + Unpin>(io: &mut R) -> std::io::Result<u64> {
    let mut encoded = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        encoded.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    meshnet_varint::decode_u64(&encoded)
        .map(|(value, _)| value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// A toy length-framed muxer: `<varint stream_id><flag byte><varint
/// len><payload>`, multiplexed over a single secured connection. Streams
/// opened locally and remotely are told apart by id parity, assigned from
/// peer id ordering so both sides agree without negotiation.
pub struct SimpleMuxer;

impl Default for SimpleMuxer {
    fn default() -> Self {
        SimpleMuxer
    }
}

#[async_trait]
impl Muxer for SimpleMuxer {
    fn protocol_id(&self) -> &'static str {
        "/meshnet/simple-mux-toy/1.0.0"
    }

    async fn upgrade(
        &self,
        io: Box<dyn SecuredConnection>,
    ) -> std::io::Result<BoxMuxedConnection> {
        let local_peer = io.local_peer();
        let remote_peer = io.remote_peer();
        let (read_half, write_half) = io.split();
        let write_half = Arc::new(SyncMutex::new(write_half));
        let incoming: Arc<SyncMutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>> =
            Arc::new(SyncMutex::new(HashMap::new()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel::<BoxStream>();

        tokio::spawn(reader_loop(
            read_half,
            incoming.clone(),
            write_half.clone(),
            accept_tx,
        ));

        // The side with the smaller peer id opens even-numbered streams;
        // the other side opens odd-numbered ones, so both agree without a
        // negotiation round trip.
        let (next_id, step) = if local_peer < remote_peer {
            (0u64, 2u64)
        } else {
            (1u64, 2u64)
        };

        Ok(Box::new(SimpleMuxedConnection {
            local_peer,
            remote_peer,
            write_half,
            incoming,
            accept_rx,
            next_id,
            step,
        }))
    }
}

async fn reader_loop(
    mut read_half: futures::io::ReadHalf<Box<dyn SecuredConnection>>,
    incoming: Arc<SyncMutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>,
    write_half: Arc<SyncMutex<WriteHalf<Box<dyn SecuredConnection>>>>,
    accept_tx: mpsc::UnboundedSender<BoxStream>,
) {
    loop {
        let id = match read_varint(&mut read_half).await {
            Ok(id) => id,
            Err(_) => break,
        };
        let mut flag = [0u8; 1];
        if read_half.read_exact(&mut flag).await.is_err() {
            break;
        }
        let len = match read_varint(&mut read_half).await {
            Ok(len) => len,
            Err(_) => break,
        };
        let mut payload = vec![0u8; len as usize];
        if read_half.read_exact(&mut payload).await.is_err() {
            break;
        }

        let mut table = incoming.lock();
        if flag[0] == FRAME_FIN {
            table.remove(&id);
            continue;
        }
        if let Some(sender) = table.get(&id) {
            let _ = sender.send(payload);
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(payload);
            table.insert(id, tx);
            drop(table);
            let stream = SimpleStream {
                id,
                write_half: write_half.clone(),
                incoming_rx: rx,
                read_buf: Vec::new(),
                read_pos: 0,
                pending_write: None,
            };
            let _ = accept_tx.send(Box::new(stream));
        }
    }
    incoming.lock().clear();
}

struct SimpleMuxedConnection {
    local_peer: PeerId,
    remote_peer: PeerId,
    write_half: Arc<SyncMutex<WriteHalf<Box<dyn SecuredConnection>>>>,
    incoming: Arc<SyncMutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>,
    accept_rx: mpsc::UnboundedReceiver<BoxStream>,
    next_id: u64,
    step: u64,
}

#[async_trait]
impl MuxedConnection for SimpleMuxedConnection {
    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    async fn open_stream(&mut self) -> std::io::Result<BoxStream> {
        let id = self.next_id;
        self.next_id += self.step;
        let (tx, rx) = mpsc::unbounded_channel();
        self.incoming.lock().insert(id, tx);
        Ok(Box::new(SimpleStream {
            id,
            write_half: self.write_half.clone(),
            incoming_rx: rx,
            read_buf: Vec::new(),
            read_pos: 0,
            pending_write: None,
        }))
    }

    async fn accept_stream(&mut self) -> std::io::Result<BoxStream> {
        self.accept_rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed")
        })
    }

    async fn close(&mut self) -> std::io::Result<()> {
        let write_half = self.write_half.clone();
        futures::future::poll_fn(|cx| {
            let mut guard = write_half.lock();
            Pin::new(&mut *guard).poll_close(cx)
        })
        .await
    }
}

struct PendingWrite {
    frame: Vec<u8>,
    sent: usize,
    original_len: usize,
}

struct SimpleStream {
    id: u64,
    write_half: Arc<SyncMutex<WriteHalf<Box<dyn SecuredConnection>>>>,
    incoming_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    pending_write: Option<PendingWrite>,
}

impl Stream for SimpleStream {
    fn id(&self) -> u64 {
        self.id
    }
}

impl AsyncRead for SimpleStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = std::cmp::min(buf.len(), this.read_buf.len() - this.read_pos);
                buf[..n].copy_from_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(n));
            }
            match this.incoming_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.read_buf = chunk;
                    this.read_pos = 0;
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for SimpleStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.pending_write.is_none() {
            this.pending_write = Some(PendingWrite {
                frame: encode_frame(this.id, FRAME_DATA, buf),
                sent: 0,
                original_len: buf.len(),
            });
        }
        let mut guard = this.write_half.lock();
        loop {
            let pending = this.pending_write.as_mut().unwrap();
            if pending.sent == pending.frame.len() {
                let n = pending.original_len;
                this.pending_write = None;
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut *guard).poll_write(cx, &pending.frame[pending.sent..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "write zero",
                    )))
                }
                Poll::Ready(Ok(written)) => pending.sent += written,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let mut guard = this.write_half.lock();
        Pin::new(&mut *guard).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let frame = encode_frame(this.id, FRAME_FIN, &[]);
        let mut guard = this.write_half.lock();
        match Pin::new(&mut *guard).poll_write(cx, &frame) {
            Poll::Ready(_) => Pin::new(&mut *guard).poll_flush(cx),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{SecurityUpgrader, XorSecurityUpgrader};
    use crate::transport::{MemoryNetwork, MemoryTransport, Transport};
    use meshnet_identity::Keypair;
    use meshnet_multiaddr::{Multiaddr, Protocol};

    #[tokio::test]
    async fn opened_stream_on_one_side_is_accepted_on_the_other() {
        let network = MemoryNetwork::new();
        let server_transport = MemoryTransport::new(network.clone());
        let (listen_addr, mut listener) = server_transport
            .listen(&Multiaddr::empty().with(Protocol::Memory(11)))
            .await
            .unwrap();
        let client_transport = MemoryTransport::new(network);

        let client_task = tokio::spawn(async move {
            let raw = client_transport.dial(&listen_addr).await.unwrap();
            let secured = XorSecurityUpgrader::new(Keypair::generate())
                .secure_outbound(raw, None)
                .await
                .unwrap();
            let mut muxed = SimpleMuxer::default().upgrade(secured).await.unwrap();
            let mut stream = muxed.open_stream().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream.flush().await.unwrap();
            let mut reply = [0u8; 5];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"world");
        });

        let raw = listener.accept().await.unwrap();
        let secured = XorSecurityUpgrader::new(Keypair::generate())
            .secure_inbound(raw)
            .await
            .unwrap();
        let mut muxed = SimpleMuxer::default().upgrade(secured).await.unwrap();
        let mut stream = muxed.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").await.unwrap();
        stream.flush().await.unwrap();

        client_task.await.unwrap();
    }
}
