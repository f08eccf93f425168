//! Integration test: a full 3-participant swap pool lifecycle against the
//! in-process reference transport and chain adapter, covering spec scenario 3
//! (circular-pair groups, rotation, burn total) and scenario 6 (a participant
//! disconnecting after setup aborts the pool).

use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
use bitcoin::Network;
use std::sync::Arc;
use std::time::Duration;

use swapsig_core::{BurnConfig, LongTermKeypair};
use swapsig_directory::Directory;
use swapsig_discovery::DiscoveryCoordinator;
use swapsig_pool::model::{PoolPhase, UtxoInput};
use swapsig_pool::PoolOrchestrator;
use swapsig_transport::mock::{MockChainAdapter, MockNetwork};

fn keypair(seed: u8) -> LongTermKeypair {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x01;
    bytes[31] = seed;
    LongTermKeypair::from_secret(SecretKey::from_slice(&bytes).unwrap())
}

fn burn_config() -> BurnConfig {
    BurnConfig {
        burn_percentage: 0.001,
        minimum_burn: 500,
        maximum_burn: 10_000,
        burn_identifier: *b"SWPB",
        pool_id_in_burn: true,
        version: 1,
    }
}

fn input(seed: u8, amount: u64) -> UtxoInput {
    UtxoInput {
        tx_id: format!("{:02x}", seed).repeat(32),
        output_index: 0,
        amount,
        script_pubkey: vec![0x51],
    }
}

/// A real, parseable regtest Taproot address, standing in for a participant's
/// final payout destination.
fn address(seed: u8) -> String {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    bytes[0] = 0x02;
    bytes[31] = seed;
    let keypair = Keypair::from_seckey_slice(&secp, &bytes).unwrap();
    let (xonly, _) = keypair.x_only_public_key();
    bitcoin::Address::p2tr(&secp, xonly, None, Network::Regtest).to_string()
}

fn orchestrator(net: &MockNetwork, peer: &str, seed: u8) -> Arc<PoolOrchestrator> {
    let (orchestrator, _chain) = orchestrator_with_chain(net, peer, seed);
    orchestrator
}

fn orchestrator_with_chain(
    net: &MockNetwork,
    peer: &str,
    seed: u8,
) -> (Arc<PoolOrchestrator>, Arc<MockChainAdapter>) {
    let transport = Arc::new(net.join(peer));
    let directory = Arc::new(Directory::new(transport.clone()));
    let discovery = Arc::new(DiscoveryCoordinator::new(keypair(seed), transport.clone(), directory.clone()));
    let chain = Arc::new(MockChainAdapter::new());
    let orchestrator = Arc::new(PoolOrchestrator::new(
        keypair(seed),
        transport,
        directory,
        discovery,
        chain.clone(),
        Network::Regtest,
    ));
    (orchestrator, chain)
}

#[tokio::test]
async fn three_participant_pool_matches_spec_worked_example() {
    let net = MockNetwork::new();
    let (alice, alice_chain) = orchestrator_with_chain(&net, "alice", 1);
    let bob = orchestrator(&net, "bob", 2);
    let carol = orchestrator(&net, "carol", 3);

    let denomination = 1_000_000;
    let pool_id = alice
        .create_pool(
            denomination,
            3,
            3,
            1_000,
            burn_config(),
            1,
            1,
            input(1, denomination),
            &address(1),
        )
        .await
        .unwrap();

    bob.join_pool(pool_id, input(2, denomination), &address(2)).await.unwrap();
    carol.join_pool(pool_id, input(3, denomination), &address(3)).await.unwrap();

    alice.begin_setup(pool_id).unwrap();
    assert_eq!(alice.phase(pool_id).unwrap(), PoolPhase::Setup);

    for (index, seed) in [(0usize, 1u8), (1, 2), (2, 3)] {
        let tx_id = format!("{:02x}", seed).repeat(32);
        alice_chain.confirm(&tx_id, 1);
        alice.record_setup_broadcast(pool_id, index, tx_id).unwrap();
    }
    assert_eq!(alice.phase(pool_id).unwrap(), PoolPhase::SetupConfirm);

    alice
        .confirm_setup(pool_id, Duration::from_millis(10), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(alice.phase(pool_id).unwrap(), PoolPhase::Reveal);

    // `register_participant` committed each destination under a nonce derived
    // from `{poolId, inputTxId}`; recompute it the same way to reveal.
    for (index, seed) in [(0usize, 1u8), (1, 2), (2, 3)] {
        let tx_id = format!("{:02x}", seed).repeat(32);
        let nonce = derive_nonce(pool_id, &tx_id);
        alice.reveal_destination(pool_id, index, &address(seed), nonce).unwrap();
    }
    assert_eq!(alice.phase(pool_id).unwrap(), PoolPhase::Settlement);

    let pools = alice_pools(&alice, pool_id);
    let strategy = pools.strategy.clone().unwrap();
    assert_eq!(strategy.group_size, 2);
    assert_eq!(pools.groups, vec![vec![0, 1], vec![1, 2], vec![2, 0]]);
    assert_eq!(pools.shared_outputs.len(), 3);

    let total_burn = 3 * burn_config().burn_amount(denomination);
    assert_eq!(total_burn, 3 * 1_000);

    let request_ids = alice.announce_settlements(pool_id).await.unwrap();
    assert_eq!(request_ids.len(), 3);
    assert_eq!(alice.phase(pool_id).unwrap(), PoolPhase::Settlement);

    // Each announced settlement carries the unsigned transaction that
    // `on_settlement_session_completed` will later attach a signature to.
    let pools = alice_pools(&alice, pool_id);
    assert!(pools.shared_outputs.iter().all(|o| o.settlement_tx.is_some()));
}

#[tokio::test]
async fn disconnect_after_setup_aborts_the_pool() {
    let net = MockNetwork::new();
    let alice = orchestrator(&net, "alice", 1);
    let bob = orchestrator(&net, "bob", 2);
    let carol = orchestrator(&net, "carol", 3);

    let denomination = 1_000_000;
    let pool_id = alice
        .create_pool(denomination, 3, 3, 1_000, burn_config(), 1, 1, input(1, denomination), &address(1))
        .await
        .unwrap();
    bob.join_pool(pool_id, input(2, denomination), &address(2)).await.unwrap();
    carol.join_pool(pool_id, input(3, denomination), &address(3)).await.unwrap();

    alice.begin_setup(pool_id).unwrap();
    let result = alice.disconnect_participant(pool_id, 2);
    assert!(result.is_err());
    assert_eq!(alice.phase(pool_id).unwrap(), PoolPhase::Aborted);
}

fn derive_nonce(pool_id: swapsig_core::Digest32, tx_id: &str) -> [u8; 16] {
    let digest = swapsig_core::digest_parts(&[pool_id.as_bytes(), tx_id.as_bytes()]);
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&digest.0[..16]);
    nonce
}

fn alice_pools(orchestrator: &PoolOrchestrator, pool_id: swapsig_core::Digest32) -> swapsig_pool::model::SwapPool {
    orchestrator.pool_snapshot(pool_id).expect("pool tracked")
}
