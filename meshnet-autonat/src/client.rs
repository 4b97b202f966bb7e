//! The requesting side of AutoNAT v2: asks a server to dial one of our own
//! candidate addresses back, and turns a handful of such probes into a
//! majority-vote reachability verdict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::AsyncWriteExt;
use meshnet_identity::PeerId;
use meshnet_multiaddr::Multiaddr;
use meshnet_multistream_select::{dialer_select_proto, BufferedFramer, Version};
use meshnet_swarm::{Node, StreamContext};
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::wire::{decode_message, encode_message, DialRequest, Message, Status};
use crate::{DIAL_BACK_PROTOCOL, DIAL_REQUEST_PROTOCOL};

const MAX_MESSAGE_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Public,
    Private,
    Unknown,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server {0} was probed less than the cooldown period ago")]
    Cooldown(PeerId),
    #[error(transparent)]
    Node(#[from] meshnet_swarm::NodeError),
    #[error(transparent)]
    Negotiation(#[from] meshnet_multistream_select::NegotiationError),
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
    #[error(transparent)]
    Framer(#[from] meshnet_multistream_select::FramerError),
    #[error("server replied with status {0:?}")]
    ServerRejected(Status),
    #[error("server reported ok but never delivered a nonce-matching dial-back")]
    NonceVerificationFailed,
    #[error("check timed out waiting on the server")]
    CheckTimedOut,
    #[error("io error talking to the server: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The server dialed us back successfully on the requested address.
    Confirmed,
    /// The server told us the dial failed, or never reached us.
    Failed,
}

pub struct ClientConfig {
    pub server_cooldown: Duration,
    pub check_timeout: Duration,
    /// Minimum number of samples before a verdict is produced at all.
    pub min_samples: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_cooldown: Duration::from_secs(30),
            check_timeout: Duration::from_secs(60),
            min_samples: 3,
        }
    }
}

struct SampleHistory {
    samples: Vec<CheckOutcome>,
}

/// Tracks per-server cooldowns, the running sample history used to derive
/// a majority verdict, and the nonces awaiting a dial-back confirmation.
/// One instance is shared by every in-flight check against a given node.
pub struct Client {
    config: ClientConfig,
    node: Node,
    last_probed: Mutex<HashMap<PeerId, Instant>>,
    history: Mutex<SampleHistory>,
    pending_nonces: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl Client {
    /// Builds the client and registers its dial-back handler on `node`,
    /// so a server that genuinely dials us back has somewhere to deliver
    /// the nonce.
    pub fn install(node: Node, config: ClientConfig) -> Arc<Client> {
        let client = Arc::new(Client {
            config,
            node: node.clone(),
            last_probed: Mutex::new(HashMap::new()),
            history: Mutex::new(SampleHistory { samples: Vec::new() }),
            pending_nonces: Mutex::new(HashMap::new()),
        });

        let handler_client = client.clone();
        node.register_handler(DIAL_BACK_PROTOCOL, move |context: StreamContext| -> BoxFuture<'static, ()> {
            let client = handler_client.clone();
            Box::pin(async move { client.handle_dial_back(context).await })
        });

        client
    }

    async fn handle_dial_back(&self, context: StreamContext) {
        let mut framer = BufferedFramer::new(context.stream, MAX_MESSAGE_SIZE);
        let Ok(bytes) = framer.read_message().await else {
            return;
        };
        let Ok(Message::DialBack(dial_back)) = decode_message(&bytes) else {
            return;
        };
        // A nonce not in the pending set (already confirmed, expired, or
        // never ours) is silently dropped, per the AutoNAT v2 contract.
        if let Some(sender) = self.pending_nonces.lock().remove(&dial_back.nonce) {
            let _ = sender.send(());
        }
    }

    /// Asks `server` to dial us back on `candidate`. Fails fast if this
    /// server was probed within the cooldown window.
    pub async fn request_check(
        &self,
        server: PeerId,
        candidate: Multiaddr,
    ) -> Result<CheckOutcome, ClientError> {
        {
            let mut last_probed = self.last_probed.lock();
            if let Some(at) = last_probed.get(&server) {
                if at.elapsed() < self.config.server_cooldown {
                    return Err(ClientError::Cooldown(server));
                }
            }
            last_probed.insert(server, Instant::now());
        }

        let nonce = rand::thread_rng().next_u64();
        let deadline = Instant::now() + self.config.check_timeout;
        let (sender, receiver) = oneshot::channel();
        self.pending_nonces.lock().insert(nonce, sender);

        let outcome = match tokio::time::timeout(
            self.config.check_timeout,
            self.run_check(server, candidate, nonce, receiver, deadline),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(ClientError::CheckTimedOut),
        };
        self.pending_nonces.lock().remove(&nonce);
        let outcome = outcome?;

        self.history.lock().samples.push(outcome);
        Ok(outcome)
    }

    async fn run_check(
        &self,
        server: PeerId,
        candidate: Multiaddr,
        nonce: u64,
        dial_back_confirmed: oneshot::Receiver<()>,
        deadline: Instant,
    ) -> Result<CheckOutcome, ClientError> {
        let stream = self.node.new_stream(server, DIAL_REQUEST_PROTOCOL).await?;
        let protocols = vec![DIAL_REQUEST_PROTOCOL.to_string()];
        let negotiated =
            dialer_select_proto(stream, &protocols, Version::V1Lazy, MAX_MESSAGE_SIZE).await?;
        let mut framer = BufferedFramer::new(negotiated.stream, MAX_MESSAGE_SIZE);

        let request = Message::DialRequest(DialRequest { address: candidate, nonce });
        write_message(&mut framer, &request).await?;

        let response_bytes = framer.read_message().await.map_err(ClientError::Framer)?;
        let response = decode_message(&response_bytes)?;
        match response {
            Message::DialResponse(response) => match response.status {
                Status::Ok => {
                    // The server claims it reached us; the nonce-bearing
                    // dial-back is the only proof that actually happened.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, dial_back_confirmed).await {
                        Ok(Ok(())) => Ok(CheckOutcome::Confirmed),
                        _ => Err(ClientError::NonceVerificationFailed),
                    }
                }
                // The server tried and failed to reach us: a real,
                // countable sample toward the reachability majority.
                Status::DialError => Ok(CheckOutcome::Failed),
                // Malformed request / internal failure: not a reachability
                // signal at all, so it is never folded into the sample
                // history (`checkFailed`, not a counted probe).
                other => {
                    log::debug!("autonat server {server} reported {other:?}");
                    Err(ClientError::ServerRejected(other))
                }
            },
            _ => Err(ClientError::ServerRejected(Status::InternalError)),
        }
    }

    /// Strict-majority verdict over every sample collected so far. Returns
    /// `Unknown` until at least `min_samples` checks have completed.
    pub fn reachability(&self) -> Reachability {
        let history = self.history.lock();
        if history.samples.len() < self.config.min_samples {
            return Reachability::Unknown;
        }
        let confirmed = history
            .samples
            .iter()
            .filter(|s| matches!(s, CheckOutcome::Confirmed))
            .count();
        if confirmed * 2 > history.samples.len() {
            Reachability::Public
        } else {
            Reachability::Private
        }
    }

    pub fn sample_count(&self) -> usize {
        self.history.lock().samples.len()
    }
}

/// Writes one length-prefixed message directly to the framer's underlying
/// stream; `BufferedFramer` only buffers reads, so writes bypass it. Shared
/// with the server side, which replies over the same framing.
pub(crate) async fn write_message<S>(
    framer: &mut BufferedFramer<S>,
    message: &Message,
) -> std::io::Result<()>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let payload = encode_message(message);
    let mut framed = Vec::new();
    meshnet_varint::encode_usize(payload.len(), &mut framed);
    framed.extend_from_slice(&payload);
    framer.get_mut().write_all(&framed).await?;
    framer.get_mut().flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_until_min_samples_collected() {
        let history = SampleHistory { samples: vec![CheckOutcome::Confirmed, CheckOutcome::Confirmed] };
        let config = ClientConfig::default();
        assert!(history.samples.len() < config.min_samples);
    }

    #[test]
    fn majority_confirmed_yields_public() {
        let samples = vec![CheckOutcome::Confirmed, CheckOutcome::Confirmed, CheckOutcome::Failed];
        let confirmed = samples.iter().filter(|s| matches!(s, CheckOutcome::Confirmed)).count();
        assert!(confirmed * 2 > samples.len());
    }

    #[test]
    fn tied_or_minority_confirmed_yields_private() {
        let samples = vec![CheckOutcome::Confirmed, CheckOutcome::Failed, CheckOutcome::Failed];
        let confirmed = samples.iter().filter(|s| matches!(s, CheckOutcome::Confirmed)).count();
        assert!(confirmed * 2 <= samples.len());
    }
}
