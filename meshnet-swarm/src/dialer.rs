//! Races a peer's known addresses against each other: ranked into Happy
//! Eyeballs groups, launched one group at a time with the group's delay,
//! first success wins and cancels every sibling attempt still in flight.

use std::sync::Arc;
use std::time::Duration;

use meshnet_core::{upgrade_outbound, BoxMuxedConnection, Transport, UpgradeConfig};
use meshnet_identity::PeerId;
use meshnet_multiaddr::Multiaddr;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use crate::error::DialError;
use crate::ranker::rank;

#[derive(Debug, Clone, Copy)]
pub struct DialerConfig {
    pub dial_timeout: Duration,
    pub max_concurrent_dials: usize,
    pub dial_concurrency_factor: usize,
}

impl Default for DialerConfig {
    fn default() -> Self {
        DialerConfig {
            dial_timeout: Duration::from_secs(30),
            max_concurrent_dials: 16,
            dial_concurrency_factor: 8,
        }
    }
}

pub struct DialOutcome {
    pub address: Multiaddr,
    pub connection: BoxMuxedConnection,
}

/// Attempts a single address: dial the transport, then run the upgrade
/// pipeline to secure and mux the raw connection.
async fn dial_one(
    transport: Arc<dyn Transport>,
    upgrade_config: Arc<UpgradeConfig>,
    address: Multiaddr,
    expected_peer: PeerId,
) -> Result<DialOutcome, DialError> {
    let raw = transport.dial(&address).await.map_err(meshnet_core::Error::Io)?;
    let connection = upgrade_outbound(&upgrade_config, raw, Some(expected_peer)).await?;
    Ok(DialOutcome {
        address,
        connection,
    })
}

/// Dials `addresses` for `expected_peer`, respecting the configured group
/// delays, overall timeout, and concurrency caps. Returns the first
/// successfully upgraded connection; every other attempt is aborted.
pub async fn smart_dial(
    config: DialerConfig,
    transport: Arc<dyn Transport>,
    upgrade_config: Arc<UpgradeConfig>,
    expected_peer: PeerId,
    addresses: &[Multiaddr],
) -> Result<DialOutcome, DialError> {
    if addresses.is_empty() {
        return Err(DialError::NoAddressesKnown(expected_peer));
    }

    let groups = rank(addresses);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_dials));
    let winner: Arc<AsyncMutex<Option<DialOutcome>>> = Arc::new(AsyncMutex::new(None));
    let mut tasks = JoinSet::new();

    let overall = async {
        for group in groups {
            if winner.lock().await.is_some() {
                break;
            }
            if !group.delay.is_zero() {
                tokio::time::sleep(group.delay).await;
            }
            if winner.lock().await.is_some() {
                break;
            }

            let per_group_cap = config.dial_concurrency_factor.min(group.addresses.len().max(1));
            for address in group.addresses.into_iter().take(per_group_cap) {
                let transport = transport.clone();
                let upgrade_config = upgrade_config.clone();
                let semaphore = semaphore.clone();
                let winner = winner.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    if winner.lock().await.is_some() {
                        return;
                    }
                    if let Ok(outcome) =
                        dial_one(transport, upgrade_config, address, expected_peer).await
                    {
                        let mut slot = winner.lock().await;
                        if slot.is_none() {
                            *slot = Some(outcome);
                        }
                    }
                });
            }
        }

        while tasks.join_next().await.is_some() {
            if winner.lock().await.is_some() {
                break;
            }
        }
    };

    let timed_out = tokio::time::timeout(config.dial_timeout, overall).await.is_err();
    tasks.abort_all();

    let mut slot = winner.lock().await;
    match slot.take() {
        Some(outcome) => Ok(outcome),
        None if timed_out => Err(DialError::Timeout),
        None => Err(DialError::AllDialsFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshnet_core::security::XorSecurityUpgrader;
    use meshnet_core::{Listener, MemoryNetwork, MemoryTransport, SimpleMuxer};
    use meshnet_identity::Keypair;

    fn upgrade_config_for(keys: Keypair) -> UpgradeConfig {
        UpgradeConfig {
            security_upgraders: vec![Arc::new(XorSecurityUpgrader::new(keys))],
            muxers: vec![Arc::new(SimpleMuxer::default())],
            max_message_size: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn dials_the_only_known_address_and_upgrades_it() {
        let network = MemoryNetwork::new();
        let server_keys = Keypair::generate();
        let client_keys = Keypair::generate();
        let server_peer = server_keys.public().to_peer_id();

        let server_transport = MemoryTransport::new(network.clone());
        let listen_addr: Multiaddr = "/memory/8200".parse().unwrap();
        let (_, mut listener) = server_transport.listen(&listen_addr).await.unwrap();

        let server_upgrade_config = Arc::new(upgrade_config_for(server_keys));
        tokio::spawn(async move {
            if let Ok(raw) = listener.accept().await {
                let _ = meshnet_core::upgrade_inbound(&server_upgrade_config, raw).await;
            }
        });

        let client_transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(network));
        let client_upgrade_config = Arc::new(upgrade_config_for(client_keys));

        let outcome = smart_dial(
            DialerConfig::default(),
            client_transport,
            client_upgrade_config,
            server_peer,
            &[listen_addr],
        )
        .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn no_known_addresses_fails_fast() {
        let network = MemoryNetwork::new();
        let keys = Keypair::generate();
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(network));
        let upgrade_config = Arc::new(upgrade_config_for(Keypair::generate()));
        let result = smart_dial(
            DialerConfig::default(),
            transport,
            upgrade_config,
            keys.public().to_peer_id(),
            &[],
        )
        .await;
        assert!(matches!(result, Err(DialError::NoAddressesKnown(_))));
    }
}
