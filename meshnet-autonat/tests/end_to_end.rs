//! Drives a full client/server AutoNAT v2 exchange over the in-memory
//! transport: dial-request, the server's own dial-back connection, and
//! the nonce-bearing dial-back stream that the client's handler confirms.

use std::sync::Arc;
use std::time::Duration;

use meshnet_autonat::{Client, ClientConfig, Server, ServerConfig};
use meshnet_core::security::XorSecurityUpgrader;
use meshnet_core::{Limits, MemoryNetwork, MemoryTransport, SimpleMuxer, UpgradeConfig};
use meshnet_identity::Keypair;
use meshnet_swarm::{BackoffConfig, DialerConfig, HealthConfig, NodeBuilder, NodeConfiguration, PoolConfig, ReconnectPolicy};

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

/// `MemoryNetwork` hands out ephemeral `/memory/<id>` ids in construction
/// order starting at 1_000_000. The server's transport claims the first
/// one and the client's the second; listening the client on that exact
/// id (rather than an arbitrary free one) makes its advertised address
/// the same one the server observes it dialing from, which is what the
/// amplification check requires.
const CLIENT_EPHEMERAL_ID: u64 = 1_000_001;

#[tokio::test]
async fn client_confirms_public_reachability_after_majority_of_dial_backs_succeed() {
    let network = MemoryNetwork::new();
    let server_keys = Keypair::generate();
    let client_keys = Keypair::generate();
    let server_peer = server_keys.public().to_peer_id();
    let client_peer = client_keys.public().to_peer_id();

    let server_listen: meshnet_multiaddr::Multiaddr = "/memory/9500".parse().unwrap();
    let client_listen: meshnet_multiaddr::Multiaddr =
        format!("/memory/{CLIENT_EPHEMERAL_ID}").parse().unwrap();

    let (server_node, _server_events) = NodeBuilder::new(
        config(server_peer, vec![server_listen.clone()]),
        Arc::new(MemoryTransport::new(network.clone())),
        upgrade_config(server_keys),
    )
    .build();
    server_node.start().await.unwrap();

    let (client_node, _client_events) = NodeBuilder::new(
        config(client_peer, vec![client_listen.clone()]),
        Arc::new(MemoryTransport::new(network)),
        upgrade_config(client_keys),
    )
    .build();
    client_node.start().await.unwrap();

    let (_server, _server_rx) = Server::install(server_node.clone(), ServerConfig::default());
    let client = Client::install(client_node.clone(), ClientConfig {
        server_cooldown: Duration::from_millis(0),
        check_timeout: Duration::from_secs(5),
        min_samples: 3,
    });

    client_node
        .connect_address(server_listen, Some(server_peer))
        .await
        .unwrap();

    for _ in 0..3 {
        let outcome = client
            .request_check(server_peer, client_listen.clone())
            .await
            .expect("dial-back round trip should succeed");
        assert_eq!(outcome, meshnet_autonat::CheckOutcome::Confirmed);
    }

    assert_eq!(client.reachability(), meshnet_autonat::Reachability::Public);
    assert_eq!(client.sample_count(), 3);
}

#[tokio::test]
async fn server_rejects_an_address_that_does_not_match_the_observed_ip() {
    let network = MemoryNetwork::new();
    let server_keys = Keypair::generate();
    let client_keys = Keypair::generate();
    let server_peer = server_keys.public().to_peer_id();
    let client_peer = client_keys.public().to_peer_id();

    let server_listen: meshnet_multiaddr::Multiaddr = "/memory/9600".parse().unwrap();
    let spoofed: meshnet_multiaddr::Multiaddr = "/memory/424242".parse().unwrap();

    let (server_node, _server_events) = NodeBuilder::new(
        config(server_peer, vec![server_listen.clone()]),
        Arc::new(MemoryTransport::new(network.clone())),
        upgrade_config(server_keys),
    )
    .build();
    server_node.start().await.unwrap();

    let (client_node, _client_events) = NodeBuilder::new(
        config(client_peer, vec![]),
        Arc::new(MemoryTransport::new(network)),
        upgrade_config(client_keys),
    )
    .build();
    client_node.start().await.unwrap();

    let (_server, _server_rx) = Server::install(server_node.clone(), ServerConfig::default());
    let client = Client::install(client_node.clone(), ClientConfig::default());

    client_node
        .connect_address(server_listen, Some(server_peer))
        .await
        .unwrap();

    let error = client
        .request_check(server_peer, spoofed)
        .await
        .expect_err("an address we never dialed from should be rejected");
    assert!(matches!(
        error,
        meshnet_autonat::ClientError::ServerRejected(meshnet_autonat::Status::BadRequest)
    ));
}
