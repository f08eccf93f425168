//! Swap pool orchestrator (§4.5): dynamic group sizing, participant
//! registration, the setup/reveal/settlement rounds, and burn-based Sybil
//! defense (§4.6). Builds on `swapsig-discovery` for the interactive MuSig2
//! signing each settlement transaction needs, and on `swapsig-transport`'s
//! `ChainAdapter` for broadcast and confirmation polling.

pub mod group;
pub mod model;
pub mod psbt;

use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swapsig_core::wire::WireError;
use swapsig_core::{digest_parts, BurnConfig, Capability, Digest32, IdentityError, LongTermKeypair, ModelError};
use swapsig_directory::{Directory, DirectoryError, DirectoryKey};
use swapsig_discovery::{DiscoveryCoordinator, DiscoveryError, DiscoveryEvent};
use swapsig_musig2::{key_agg_tweaked, MusigError};
use swapsig_transport::{ChainAdapter, ChainError, Transport, TransportError};
use thiserror::Error;

use model::{Participant, PoolAnnouncement, PoolPhase, SharedOutput, SwapPool, UtxoInput};
use psbt::PsbtError;

const STREAM_CIPHER_LABEL: &[u8] = b"swapsig-destination-v1";

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Musig2(#[from] MusigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Psbt(#[from] PsbtError),
    #[error("pool {0} not found")]
    UnknownPool(String),
    #[error("participant input amount {actual} does not match denomination {expected}")]
    DenominationMismatch { expected: u64, actual: u64 },
    #[error("revealed destination does not match the committed digest")]
    CommitmentMismatch,
    #[error("pool does not have enough participants: have {have}, need {need}")]
    InsufficientParticipants { have: usize, need: usize },
    #[error("a participant disconnected after setup began; the pool cannot safely re-mix")]
    ParticipantDisconnected,
    #[error("operation requires phase {expected:?}, pool is in {actual:?}")]
    WrongPhase { expected: PoolPhase, actual: PoolPhase },
    #[error("pool is full: {max} participants already registered")]
    PoolFull { max: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn pool_topic(pool_id: Digest32) -> String {
    format!("swapsig-pool:{}", pool_id.to_hex())
}

/// Keystream-xor "encryption" of the final destination string, keyed by the
/// pool id and a per-participant nonce. This only obscures the destination
/// from passive observers of the registration broadcast; it is not a
/// substitute for a real AEAD and is documented as such in DESIGN.md.
fn xor_keystream(pool_id: Digest32, nonce: &[u8; 16], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;
    while out.len() < len {
        let block = digest_parts(&[
            STREAM_CIPHER_LABEL,
            pool_id.as_bytes(),
            nonce,
            &counter.to_le_bytes(),
        ]);
        out.extend_from_slice(block.as_bytes());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn encrypt_destination(pool_id: Digest32, nonce: &[u8; 16], plaintext: &str) -> Vec<u8> {
    let keystream = xor_keystream(pool_id, nonce, plaintext.len());
    plaintext
        .as_bytes()
        .iter()
        .zip(keystream.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

fn destination_commitment(plaintext: &str, nonce: &[u8; 16]) -> Digest32 {
    digest_parts(&[plaintext.as_bytes(), nonce])
}

/// `hex::encode(sig)` serde helper shared by this crate's signed value types.
pub(crate) mod schnorr_sig_serde {
    use bitcoin::secp256k1::schnorr::Signature;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(sig.as_ref() as &[u8]).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let hexstr = String::deserialize(d)?;
        let bytes = hex::decode(hexstr).map_err(serde::de::Error::custom)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Metadata carried by a settlement signing request, so the discovery layer
/// (which is blind to pool semantics) can still announce something
/// self-describing.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SettlementRequestMetadata {
    transaction_type: &'static str,
    swap_phase: &'static str,
    swap_pool_id: Digest32,
    output_index: usize,
}

/// Orchestrates one node's view of every swap pool it participates in or
/// created. Wraps a [`DiscoveryCoordinator`] for the interactive settlement
/// signing and a [`ChainAdapter`] for broadcast/confirmation.
pub struct PoolOrchestrator {
    identity: LongTermKeypair,
    transport: Arc<dyn Transport>,
    directory: Arc<Directory>,
    discovery: Arc<DiscoveryCoordinator>,
    chain: Arc<dyn ChainAdapter>,
    network: Network,
    pools: Mutex<HashMap<Digest32, SwapPool>>,
}

impl PoolOrchestrator {
    pub fn new(
        identity: LongTermKeypair,
        transport: Arc<dyn Transport>,
        directory: Arc<Directory>,
        discovery: Arc<DiscoveryCoordinator>,
        chain: Arc<dyn ChainAdapter>,
        network: Network,
    ) -> Self {
        Self {
            identity,
            transport,
            directory,
            discovery,
            chain,
            network,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// `createPool`: announce a new pool and register its creator as
    /// participant 0.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_pool(
        &self,
        denomination: u64,
        min_participants: usize,
        max_participants: usize,
        fee_rate: u64,
        burn_config: BurnConfig,
        setup_confirmations: u32,
        settlement_confirmations: u32,
        input: UtxoInput,
        final_destination: &str,
    ) -> Result<Digest32, PoolError> {
        let now = now_secs();
        let announcement = PoolAnnouncement::new(
            &self.identity,
            denomination,
            min_participants,
            max_participants,
            fee_rate,
            burn_config,
            setup_confirmations,
            settlement_confirmations,
            now,
        );
        let pool_id = announcement.pool_id;
        let mut pool = SwapPool::from_announcement(&announcement, self.transport.peer_id().to_string());

        let bytes = serde_json::to_vec(&announcement).expect("pool announcement is always json-serializable");
        self.directory
            .publish(&DirectoryKey::Pool(pool_id), bytes, Duration::from_secs(3600))
            .await?;

        self.register_participant(&mut pool, input, final_destination, now)?;
        self.pools.lock().unwrap().insert(pool_id, pool);

        log::info!("created swap pool {}", pool_id.to_hex());
        Ok(pool_id)
    }

    /// `joinPool`: discover the pool if unknown, validate the pledged input,
    /// and register as the next participant.
    pub async fn join_pool(
        &self,
        pool_id: Digest32,
        input: UtxoInput,
        final_destination: &str,
    ) -> Result<usize, PoolError> {
        {
            let pools = self.pools.lock().unwrap();
            if !pools.contains_key(&pool_id) {
                drop(pools);
                self.discover_pool(pool_id).await?;
            }
        }

        let now = now_secs();
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        let index = self.register_participant(pool, input, final_destination, now)?;

        let participant = pool.participants[index].clone();
        let pool_snapshot_phase = pool.phase;
        let max_participants = pool.max_participants;
        drop(pools);

        let bytes = serde_json::to_vec(&participant).expect("participant is always json-serializable");
        self.transport
            .publish(&pool_topic(pool_id), &bytes)
            .await?;

        self.discovery
            .advertise_signer(
                Capability {
                    tx_types: vec!["swap".to_string()],
                    min_amount: 0,
                    max_amount: u64::MAX,
                },
                Some(format!("poolId={}", pool_id.to_hex())),
                Duration::from_secs(3600),
            )
            .await?;

        log::info!(
            "joined pool {} as participant {index} (phase={pool_snapshot_phase:?}, max={max_participants})",
            pool_id.to_hex()
        );
        Ok(index)
    }

    async fn discover_pool(&self, pool_id: Digest32) -> Result<(), PoolError> {
        let bytes = self
            .directory
            .fetch(&DirectoryKey::Pool(pool_id))
            .await?
            .ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        let announcement: PoolAnnouncement =
            serde_json::from_slice(&bytes).map_err(|e| PoolError::MalformedPayload(e.to_string()))?;
        announcement.verify()?;
        let pool = SwapPool::from_announcement(&announcement, "unknown".to_string());
        self.pools.lock().unwrap().entry(pool_id).or_insert(pool);
        Ok(())
    }

    fn register_participant(
        &self,
        pool: &mut SwapPool,
        input: UtxoInput,
        final_destination: &str,
        now: u64,
    ) -> Result<usize, PoolError> {
        if pool.phase != PoolPhase::Registration {
            return Err(PoolError::WrongPhase {
                expected: PoolPhase::Registration,
                actual: pool.phase,
            });
        }
        if pool.participants.len() >= pool.max_participants {
            return Err(PoolError::PoolFull { max: pool.max_participants });
        }
        if input.amount != pool.denomination {
            return Err(PoolError::DenominationMismatch {
                expected: pool.denomination,
                actual: input.amount,
            });
        }

        let ownership_digest = digest_parts(&[
            pool.pool_id.as_bytes(),
            input.tx_id.as_bytes(),
            &input.output_index.to_le_bytes(),
        ]);
        let ownership_proof = self.identity.sign_schnorr(&ownership_digest.0);

        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&digest_parts(&[pool.pool_id.as_bytes(), input.tx_id.as_bytes()]).0[..16]);
        let ciphertext = encrypt_destination(pool.pool_id, &nonce, final_destination);
        let commitment = destination_commitment(final_destination, &nonce);

        let participant_index = pool.participants.len();
        pool.participants.push(Participant {
            peer: self.transport.peer_id().to_string(),
            participant_index,
            signer_pub_key: self.identity.public_key(),
            input,
            ownership_proof,
            final_destination_ciphertext: ciphertext,
            final_destination_nonce: nonce,
            final_destination_commitment: commitment,
            final_address: None,
            setup_tx_id: None,
            setup_confirmed: false,
            joined_at: now,
        });
        Ok(participant_index)
    }

    /// Apply an inbound `PARTICIPANT_REGISTERED` broadcast from a peer.
    pub fn handle_participant_registered(&self, pool_id: Digest32, payload: &[u8]) -> Result<(), PoolError> {
        let participant: Participant =
            serde_json::from_slice(payload).map_err(|e| PoolError::MalformedPayload(e.to_string()))?;
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        if pool.phase != PoolPhase::Registration {
            return Ok(());
        }
        if pool.find_participant(&participant.signer_pub_key).is_none() {
            pool.participants.push(participant);
        }
        Ok(())
    }

    /// Participant disconnection policy (§4.5): before setup, drop and
    /// continue if the pool still clears `minParticipants`; from setup
    /// onward, abort unconditionally since in-flight outputs can't be re-mixed.
    pub fn disconnect_participant(&self, pool_id: Digest32, participant_index: usize) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;

        match pool.phase {
            PoolPhase::Registration => {
                if participant_index < pool.participants.len() {
                    pool.participants.remove(participant_index);
                    for (i, p) in pool.participants.iter_mut().enumerate() {
                        p.participant_index = i;
                    }
                }
                if pool.participants.len() < pool.min_participants {
                    pool.phase = PoolPhase::Aborted;
                    return Err(PoolError::InsufficientParticipants {
                        have: pool.participants.len(),
                        need: pool.min_participants,
                    });
                }
                Ok(())
            }
            PoolPhase::Aborted | PoolPhase::Complete => Ok(()),
            _ => {
                pool.phase = PoolPhase::Aborted;
                Err(PoolError::ParticipantDisconnected)
            }
        }
    }

    /// Close registration and derive the group-sizing strategy, the groups
    /// themselves, and every participant's shared Taproot output.
    pub fn begin_setup(&self, pool_id: Digest32) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        if pool.phase != PoolPhase::Registration {
            return Err(PoolError::WrongPhase {
                expected: PoolPhase::Registration,
                actual: pool.phase,
            });
        }
        let n = pool.participants.len();
        if n < pool.min_participants {
            return Err(PoolError::InsufficientParticipants {
                have: n,
                need: pool.min_participants,
            });
        }

        let strategy = group::choose_group_size_strategy(n as u32)
            .ok_or(PoolError::InsufficientParticipants { have: n, need: 2 })?;
        let groups = group::build_groups(&strategy, n as u32);

        let mut shared_outputs = Vec::with_capacity(n);
        for (group_index, members) in groups.iter().enumerate() {
            let signer_keys: Vec<PublicKey> = members
                .iter()
                .map(|&idx| pool.participants[idx].signer_pub_key)
                .collect();
            let (_, aggregated_key) = key_agg_tweaked(&signer_keys)?;
            let secp = bitcoin::secp256k1::Secp256k1::verification_only();
            let taproot_script_pubkey = bitcoin::Address::p2tr(&secp, aggregated_key, None, self.network)
                .script_pubkey()
                .to_bytes();
            // The group's shared output is funded by its first member's setup
            // transaction alone; `owner_index` names that funding participant,
            // not every signer over the aggregated key.
            let owner_index = members[0];
            shared_outputs.push(SharedOutput {
                owner_index,
                group_index,
                signers: signer_keys,
                aggregated_key,
                taproot_script_pubkey,
                amount: pool.denomination,
                settlement_session_id: None,
                settlement_tx: None,
                settlement_tx_id: None,
                settled: false,
            });
        }

        pool.strategy = Some(strategy);
        pool.groups = groups;
        pool.shared_outputs = shared_outputs;
        pool.phase = PoolPhase::Setup;
        log::info!("pool {} entering setup with {n} participants", pool_id.to_hex());
        Ok(())
    }

    /// Record that `participant_index`'s individually-signed setup
    /// transaction was broadcast, and transition to `SetupConfirm` once every
    /// participant has one on record.
    pub fn record_setup_broadcast(
        &self,
        pool_id: Digest32,
        participant_index: usize,
        tx_id: String,
    ) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        if pool.phase != PoolPhase::Setup {
            return Err(PoolError::WrongPhase { expected: PoolPhase::Setup, actual: pool.phase });
        }
        pool.participants[participant_index].setup_tx_id = Some(tx_id);
        if pool.participants.iter().all(|p| p.setup_tx_id.is_some()) {
            pool.phase = PoolPhase::SetupConfirm;
        }
        Ok(())
    }

    /// Poll every setup transaction for confirmations. Aborts the pool on
    /// timeout or failure, per §4.5.
    pub async fn confirm_setup(
        &self,
        pool_id: Digest32,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<(), PoolError> {
        let (tx_ids, required, n): (Vec<(usize, String)>, u32, usize) = {
            let pools = self.pools.lock().unwrap();
            let pool = pools.get(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
            if pool.phase != PoolPhase::SetupConfirm {
                return Err(PoolError::WrongPhase { expected: PoolPhase::SetupConfirm, actual: pool.phase });
            }
            let ids = pool
                .participants
                .iter()
                .enumerate()
                .map(|(i, p)| (i, p.setup_tx_id.clone().expect("setup_tx_id set before SetupConfirm")))
                .collect();
            (ids, pool.setup_confirmations, pool.participants.len())
        };

        for (index, tx_id) in tx_ids {
            let result = self
                .chain
                .wait_for_confirmations(&tx_id, required, poll_interval, deadline)
                .await;
            let mut pools = self.pools.lock().unwrap();
            let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
            match result {
                Ok(confirmation) if confirmation.is_confirmed => {
                    pool.participants[index].setup_confirmed = true;
                }
                Ok(_) | Err(_) => {
                    pool.phase = PoolPhase::Aborted;
                    return Err(PoolError::Chain(ChainError::ConfirmationTimeout));
                }
            }
        }

        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        if pool.participants.iter().all(|p| p.setup_confirmed) && pool.participants.len() == n {
            pool.phase = PoolPhase::Reveal;
        }
        Ok(())
    }

    /// Reveal a participant's committed final destination, verifying it
    /// against their commitment digest. Transitions to `Settlement` once
    /// every participant has revealed.
    pub fn reveal_destination(
        &self,
        pool_id: Digest32,
        participant_index: usize,
        plaintext: &str,
        nonce: [u8; 16],
    ) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        if pool.phase != PoolPhase::Reveal {
            return Err(PoolError::WrongPhase { expected: PoolPhase::Reveal, actual: pool.phase });
        }
        let participant = &mut pool.participants[participant_index];
        if destination_commitment(plaintext, &nonce) != participant.final_destination_commitment {
            return Err(PoolError::CommitmentMismatch);
        }
        participant.final_address = Some(plaintext.to_string());

        if pool.participants.iter().all(|p| p.final_address.is_some()) {
            pool.phase = PoolPhase::Settlement;
        }
        Ok(())
    }

    /// Announce one MuSig2 signing request per shared output, so each
    /// group's signers can auto-join and co-sign its settlement transaction.
    pub async fn announce_settlements(&self, pool_id: Digest32) -> Result<Vec<Digest32>, PoolError> {
        let (outputs, strategy, groups, n): (Vec<SharedOutput>, group::GroupSizeStrategy, Vec<Vec<usize>>, u32) = {
            let pools = self.pools.lock().unwrap();
            let pool = pools.get(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
            if pool.phase != PoolPhase::Settlement {
                return Err(PoolError::WrongPhase { expected: PoolPhase::Settlement, actual: pool.phase });
            }
            (
                pool.shared_outputs.clone(),
                pool.strategy.clone().expect("strategy set during begin_setup"),
                pool.groups.clone(),
                pool.participants.len() as u32,
            )
        };

        let mut request_ids = Vec::with_capacity(outputs.len());
        for (output_index, output) in outputs.iter().enumerate() {
            let destination_index = group::settlement_destination(&strategy, &groups, output.group_index, n);
            let (destination_address, setup_tx_id, fee_rate) = {
                let pools = self.pools.lock().unwrap();
                let pool = pools.get(&pool_id).unwrap();
                (
                    pool.participants[destination_index]
                        .final_address
                        .clone()
                        .expect("destination revealed before settlement begins"),
                    pool.participants[output.owner_index]
                        .setup_tx_id
                        .clone()
                        .expect("setup confirmed before settlement begins"),
                    pool.fee_rate,
                )
            };
            let destination = bitcoin::Address::from_str(&destination_address)
                .map_err(|e| PoolError::MalformedPayload(e.to_string()))?
                .require_network(self.network)
                .map_err(|e| PoolError::MalformedPayload(e.to_string()))?;

            let tx = psbt::build_settlement_tx(&setup_tx_id, 0, output.amount, fee_rate, &destination)?;
            let prevout = bitcoin::TxOut {
                value: bitcoin::Amount::from_sat(output.amount),
                script_pubkey: bitcoin::ScriptBuf::from_bytes(output.taproot_script_pubkey.clone()),
            };
            let message = psbt::settlement_sighash(&tx, &prevout)?;

            let metadata = serde_json::to_string(&SettlementRequestMetadata {
                transaction_type: "swap",
                swap_phase: "settlement",
                swap_pool_id: pool_id,
                output_index,
            })
            .expect("settlement metadata is always json-serializable");

            let request_id = self
                .discovery
                .announce_signing_request(output.signers.clone(), message, Some(metadata))
                .await?;

            let mut pools = self.pools.lock().unwrap();
            let pool = pools.get_mut(&pool_id).unwrap();
            pool.shared_outputs[output_index].settlement_session_id = Some(request_id);
            pool.shared_outputs[output_index].settlement_tx = Some(tx);
            request_ids.push(request_id);
        }
        Ok(request_ids)
    }

    /// React to a [`DiscoveryEvent`] for a settlement session: once its
    /// MuSig2 round completes, fetch the aggregated signature and broadcast
    /// the finished settlement transaction.
    pub async fn on_settlement_session_completed(
        &self,
        pool_id: Digest32,
        event: &DiscoveryEvent,
    ) -> Result<(), PoolError> {
        let DiscoveryEvent::SessionCompleted(session_id) = event else {
            return Ok(());
        };

        let (output_index, mut tx) = {
            let pools = self.pools.lock().unwrap();
            let pool = pools.get(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
            let Some(output_index) = pool
                .shared_outputs
                .iter()
                .position(|o| o.settlement_session_id == Some(*session_id))
            else {
                return Ok(());
            };
            let tx = pool.shared_outputs[output_index]
                .settlement_tx
                .clone()
                .expect("settlement tx built before its signing session completes");
            (output_index, tx)
        };

        let signature = self.discovery.final_signature(*session_id)?;
        tx.input[0].witness = bitcoin::Witness::from_slice(&[signature.to_vec()]);
        let raw_hex = bitcoin::consensus::encode::serialize_hex(&tx);
        let tx_id = self.chain.broadcast_transaction(&raw_hex).await?;

        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        pool.shared_outputs[output_index].settlement_tx_id = Some(tx_id);
        pool.shared_outputs[output_index].settled = true;
        if pool.shared_outputs.iter().all(|o| o.settled) {
            pool.phase = PoolPhase::SettlementConfirm;
        }
        Ok(())
    }

    /// Poll every settlement transaction for confirmations, completing the
    /// pool once all are confirmed.
    pub async fn confirm_settlements(
        &self,
        pool_id: Digest32,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<(), PoolError> {
        let (tx_ids, required): (Vec<String>, u32) = {
            let pools = self.pools.lock().unwrap();
            let pool = pools.get(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
            if pool.phase != PoolPhase::SettlementConfirm {
                return Err(PoolError::WrongPhase {
                    expected: PoolPhase::SettlementConfirm,
                    actual: pool.phase,
                });
            }
            (
                pool.shared_outputs
                    .iter()
                    .map(|o| o.settlement_tx_id.clone().expect("set before SettlementConfirm"))
                    .collect(),
                pool.settlement_confirmations,
            )
        };

        for tx_id in tx_ids {
            let confirmation = self
                .chain
                .wait_for_confirmations(&tx_id, required, poll_interval, deadline)
                .await?;
            if !confirmation.is_confirmed {
                let mut pools = self.pools.lock().unwrap();
                let pool = pools.get_mut(&pool_id).unwrap();
                pool.phase = PoolPhase::Aborted;
                return Err(PoolError::Chain(ChainError::ConfirmationTimeout));
            }
        }

        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&pool_id).ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))?;
        pool.phase = PoolPhase::Complete;
        log::info!("pool {} complete", pool_id.to_hex());
        Ok(())
    }

    /// Every pool id this node currently tracks, in no particular order.
    pub fn tracked_pool_ids(&self) -> Vec<Digest32> {
        self.pools.lock().unwrap().keys().copied().collect()
    }

    /// A snapshot of one pool's current state, for callers that only need to
    /// inspect it (tests, status reporting) rather than drive a transition.
    pub fn pool_snapshot(&self, pool_id: Digest32) -> Option<SwapPool> {
        self.pools.lock().unwrap().get(&pool_id).cloned()
    }

    pub fn phase(&self, pool_id: Digest32) -> Result<PoolPhase, PoolError> {
        self.pools
            .lock()
            .unwrap()
            .get(&pool_id)
            .map(|p| p.phase)
            .ok_or_else(|| PoolError::UnknownPool(pool_id.to_hex()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;
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

    fn orchestrator(net: &MockNetwork, peer: &str, seed: u8) -> Arc<PoolOrchestrator> {
        let transport = Arc::new(net.join(peer));
        let directory = Arc::new(Directory::new(transport.clone()));
        let identity = keypair(seed);
        let discovery = Arc::new(DiscoveryCoordinator::new(
            keypair(seed),
            transport.clone(),
            directory.clone(),
        ));
        let _ = &identity;
        Arc::new(PoolOrchestrator::new(
            keypair(seed),
            transport,
            directory,
            discovery,
            Arc::new(MockChainAdapter::new()),
            bitcoin::Network::Regtest,
        ))
    }

    #[tokio::test]
    async fn create_pool_registers_creator_as_participant_zero() {
        let net = MockNetwork::new();
        let orchestrator = orchestrator(&net, "alice", 1);

        let pool_id = orchestrator
            .create_pool(
                1_000_000,
                3,
                3,
                1_000,
                burn_config(),
                1,
                1,
                input(1, 1_000_000),
                "bc1qalice",
            )
            .await
            .unwrap();

        assert_eq!(orchestrator.phase(pool_id).unwrap(), PoolPhase::Registration);
    }

    #[tokio::test]
    async fn join_pool_rejects_denomination_mismatch() {
        let net = MockNetwork::new();
        let orchestrator = orchestrator(&net, "alice", 1);
        let pool_id = orchestrator
            .create_pool(1_000_000, 3, 3, 1_000, burn_config(), 1, 1, input(1, 1_000_000), "bc1qalice")
            .await
            .unwrap();

        let result = orchestrator.join_pool(pool_id, input(2, 500_000), "bc1qbob").await;
        assert!(matches!(result, Err(PoolError::DenominationMismatch { .. })));
    }

    #[tokio::test]
    async fn three_participant_pool_reaches_setup_with_circular_groups() {
        let net = MockNetwork::new();
        let orchestrator = orchestrator(&net, "alice", 1);
        let pool_id = orchestrator
            .create_pool(1_000_000, 3, 3, 1_000, burn_config(), 1, 1, input(1, 1_000_000), "bc1qalice")
            .await
            .unwrap();

        let bob_index = orchestrator.join_pool(pool_id, input(2, 1_000_000), "bc1qbob").await.unwrap();
        let carol_index = orchestrator.join_pool(pool_id, input(3, 1_000_000), "bc1qcarol").await.unwrap();
        assert_eq!(bob_index, 1);
        assert_eq!(carol_index, 2);

        orchestrator.begin_setup(pool_id).unwrap();
        assert_eq!(orchestrator.phase(pool_id).unwrap(), PoolPhase::Setup);

        let pools = orchestrator.pools.lock().unwrap();
        let pool = pools.get(&pool_id).unwrap();
        let strategy = pool.strategy.as_ref().unwrap();
        assert_eq!(strategy.group_size, 2);
        assert_eq!(pool.shared_outputs.len(), 3);
        // One shared output per group, funded by that group's first member.
        let owners: Vec<usize> = pool.shared_outputs.iter().map(|o| o.owner_index).collect();
        assert_eq!(owners, vec![0, 1, 2]);
    }

    #[test]
    fn disconnect_before_setup_continues_if_above_minimum() {
        let net = MockNetwork::new();
        let orchestrator = Arc::new(PoolOrchestrator::new(
            keypair(1),
            Arc::new(net.join("alice")),
            Arc::new(Directory::new(Arc::new(net.join("alice-dir")))),
            Arc::new(DiscoveryCoordinator::new(
                keypair(1),
                Arc::new(net.join("alice-disc")),
                Arc::new(Directory::new(Arc::new(net.join("alice-disc-dir")))),
            )),
            Arc::new(MockChainAdapter::new()),
            bitcoin::Network::Regtest,
        ));
        let announcement = PoolAnnouncement::new(&keypair(1), 1_000_000, 2, 5, 1_000, burn_config(), 1, 1, 100);
        let pool_id = announcement.pool_id;
        let mut pool = SwapPool::from_announcement(&announcement, "alice".to_string());
        orchestrator.register_participant(&mut pool, input(1, 1_000_000), "bc1qa", 100).unwrap();
        orchestrator.register_participant(&mut pool, input(2, 1_000_000), "bc1qb", 100).unwrap();
        orchestrator.register_participant(&mut pool, input(3, 1_000_000), "bc1qc", 100).unwrap();
        orchestrator.pools.lock().unwrap().insert(pool_id, pool);

        orchestrator.disconnect_participant(pool_id, 2).unwrap();
        assert_eq!(orchestrator.phase(pool_id).unwrap(), PoolPhase::Registration);

        let result = orchestrator.disconnect_participant(pool_id, 0);
        assert!(matches!(result, Err(PoolError::InsufficientParticipants { .. })));
        assert_eq!(orchestrator.phase(pool_id).unwrap(), PoolPhase::Aborted);
    }
}
