//! Runs two `meshnet-swarm` nodes over the in-memory transport and has one
//! dial-ping the other on `/ipfs/ping/1.0.0`: 32 random bytes out, the same
//! 32 bytes back, timed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::{AsyncReadExt, AsyncWriteExt};
use meshnet_core::security::XorSecurityUpgrader;
use meshnet_core::{Limits, MemoryNetwork, MemoryTransport, SimpleMuxer, UpgradeConfig};
use meshnet_identity::Keypair;
use meshnet_swarm::{
    BackoffConfig, DialerConfig, HealthConfig, Node, NodeBuilder, NodeConfiguration, PoolConfig,
    ReconnectPolicy, StreamContext,
};
use rand::RngCore;

const PING_PROTOCOL: &str = "/ipfs/ping/1.0.0";
const PING_SIZE: usize = 32;

fn config(local_peer: meshnet_identity::PeerId, listen: Vec<meshnet_multiaddr::Multiaddr>) -> NodeConfiguration {
    NodeConfiguration {
        local_peer,
        listen_addresses: listen,
        pool: PoolConfig::default(),
        dialer: DialerConfig::default(),
        backoff: BackoffConfig::default(),
        reconnect: ReconnectPolicy::default(),
        health: HealthConfig::default(),
        idle_timeout: Duration::from_secs(300),
        observed_address_confirmations: 3,
        resource_limits: Limits::default(),
    }
}

fn upgrade_config(keys: Keypair) -> UpgradeConfig {
    UpgradeConfig {
        security_upgraders: vec![Arc::new(XorSecurityUpgrader::new(keys))],
        muxers: vec![Arc::new(SimpleMuxer::default())],
        max_message_size: 64 * 1024,
    }
}

fn register_ping_handler(node: &Node) {
    node.register_handler(PING_PROTOCOL, move |mut context: StreamContext| -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut buf = [0u8; PING_SIZE];
            if context.stream.read_exact(&mut buf).await.is_err() {
                return;
            }
            let _ = context.stream.write_all(&buf).await;
            let _ = context.stream.flush().await;
        })
    });
}

async fn ping(node: &Node, peer: meshnet_identity::PeerId) -> std::io::Result<Duration> {
    let mut stream = node
        .new_stream(peer, PING_PROTOCOL)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

    let mut payload = [0u8; PING_SIZE];
    rand::thread_rng().fill_bytes(&mut payload);

    let sent_at = Instant::now();
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let mut echoed = [0u8; PING_SIZE];
    stream.read_exact(&mut echoed).await?;
    let elapsed = sent_at.elapsed();

    if echoed != payload {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "echoed payload did not match"));
    }
    Ok(elapsed)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let network = MemoryNetwork::new();
    let server_keys = Keypair::generate();
    let client_keys = Keypair::generate();
    let server_peer = server_keys.public().to_peer_id();
    let client_peer = client_keys.public().to_peer_id();

    let server_listen: meshnet_multiaddr::Multiaddr = "/memory/9000".parse().unwrap();

    let (server, _server_events) = NodeBuilder::new(
        config(server_peer, vec![server_listen.clone()]),
        Arc::new(MemoryTransport::new(network.clone())),
        upgrade_config(server_keys),
    )
    .build();
    register_ping_handler(&server);
    server.start().await.expect("server failed to start");

    let (client, _client_events) = NodeBuilder::new(
        config(client_peer, vec![]),
        Arc::new(MemoryTransport::new(network)),
        upgrade_config(client_keys),
    )
    .build();
    client.start().await.expect("client failed to start");

    client
        .connect_address(server_listen, Some(server_peer))
        .await
        .expect("client failed to connect to server");

    for round in 1..=4 {
        match ping(&client, server_peer).await {
            Ok(rtt) => println!("ping {round}: {PING_SIZE} bytes to {server_peer} round-trip in {rtt:?}"),
            Err(err) => println!("ping {round}: failed: {err}"),
        }
    }

    client.shutdown().await;
    server.shutdown().await;
}
