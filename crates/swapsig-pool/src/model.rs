//! Swap pool data model (§4.5): pool state, registered participants, and the
//! per-participant Taproot outputs produced by the setup round.

use bitcoin::secp256k1::{schnorr, PublicKey, XOnlyPublicKey};
use bitcoin::Transaction;
use serde::{Deserialize, Serialize};
use swapsig_core::{digest_parts, BurnConfig, Digest32, IdentityError, LongTermKeypair};

use crate::group::GroupSizeStrategy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolPhase {
    Registration,
    Setup,
    SetupConfirm,
    Reveal,
    Settlement,
    SettlementConfirm,
    Complete,
    Aborted,
}

/// A spendable output a participant contributes as their pool input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoInput {
    pub tx_id: String,
    pub output_index: u32,
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
}

/// The signed claim a pool creator publishes so the pool can be discovered by
/// peers who weren't dialed in directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolAnnouncement {
    pub pool_id: Digest32,
    pub creator_pub_key: PublicKey,
    pub denomination: u64,
    pub min_participants: usize,
    pub max_participants: usize,
    pub fee_rate: u64,
    pub burn_config: BurnConfig,
    pub setup_confirmations: u32,
    pub settlement_confirmations: u32,
    pub created_at: u64,
    #[serde(with = "super::schnorr_sig_serde")]
    pub creator_signature: schnorr::Signature,
}

impl PoolAnnouncement {
    pub fn new(
        keypair: &LongTermKeypair,
        denomination: u64,
        min_participants: usize,
        max_participants: usize,
        fee_rate: u64,
        burn_config: BurnConfig,
        setup_confirmations: u32,
        settlement_confirmations: u32,
        created_at: u64,
    ) -> Self {
        let creator_pub_key = keypair.public_key();
        let pool_id = digest_parts(&[
            &creator_pub_key.serialize(),
            &denomination.to_le_bytes(),
            &created_at.to_le_bytes(),
        ]);
        let digest = Self::signing_digest(
            &pool_id,
            &creator_pub_key,
            denomination,
            min_participants,
            max_participants,
            fee_rate,
            setup_confirmations,
            settlement_confirmations,
            created_at,
        );
        let creator_signature = keypair.sign_schnorr(&digest);
        Self {
            pool_id,
            creator_pub_key,
            denomination,
            min_participants,
            max_participants,
            fee_rate,
            burn_config,
            setup_confirmations,
            settlement_confirmations,
            created_at,
            creator_signature,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn signing_digest(
        pool_id: &Digest32,
        creator_pub_key: &PublicKey,
        denomination: u64,
        min_participants: usize,
        max_participants: usize,
        fee_rate: u64,
        setup_confirmations: u32,
        settlement_confirmations: u32,
        created_at: u64,
    ) -> [u8; 32] {
        digest_parts(&[
            pool_id.as_bytes(),
            &creator_pub_key.serialize(),
            &denomination.to_le_bytes(),
            &(min_participants as u64).to_le_bytes(),
            &(max_participants as u64).to_le_bytes(),
            &fee_rate.to_le_bytes(),
            &setup_confirmations.to_le_bytes(),
            &settlement_confirmations.to_le_bytes(),
            &created_at.to_le_bytes(),
        ])
        .0
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        let digest = Self::signing_digest(
            &self.pool_id,
            &self.creator_pub_key,
            self.denomination,
            self.min_participants,
            self.max_participants,
            self.fee_rate,
            self.setup_confirmations,
            self.settlement_confirmations,
            self.created_at,
        );
        swapsig_core::verify_schnorr(&self.creator_pub_key, &digest, &self.creator_signature)
    }
}

/// A registered participant: their pledged input, ownership proof, and the
/// committed (not yet revealed) final destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub peer: String,
    pub participant_index: usize,
    pub signer_pub_key: PublicKey,
    pub input: UtxoInput,
    #[serde(with = "super::schnorr_sig_serde")]
    pub ownership_proof: schnorr::Signature,
    pub final_destination_ciphertext: Vec<u8>,
    pub final_destination_nonce: [u8; 16],
    pub final_destination_commitment: Digest32,
    pub final_address: Option<String>,
    pub setup_tx_id: Option<String>,
    pub setup_confirmed: bool,
    pub joined_at: u64,
}

/// The Taproot output a single participant's setup transaction pays into
/// their group's aggregated key. Settlement spends these one at a time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SharedOutput {
    pub owner_index: usize,
    pub group_index: usize,
    pub signers: Vec<PublicKey>,
    pub aggregated_key: XOnlyPublicKey,
    pub taproot_script_pubkey: Vec<u8>,
    pub amount: u64,
    pub settlement_session_id: Option<Digest32>,
    /// The unsigned settlement transaction built in `announce_settlements`,
    /// held here so the final signature can be attached to it once its
    /// MuSig2 session completes.
    pub settlement_tx: Option<Transaction>,
    pub settlement_tx_id: Option<String>,
    pub settled: bool,
}

/// Full state of one swap pool, owned and advanced by the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapPool {
    pub pool_id: Digest32,
    pub denomination: u64,
    pub min_participants: usize,
    pub max_participants: usize,
    pub fee_rate: u64,
    pub burn_config: BurnConfig,
    pub setup_confirmations: u32,
    pub settlement_confirmations: u32,
    pub creator_peer: String,
    pub creator_pub_key: PublicKey,
    pub created_at: u64,
    pub phase: PoolPhase,
    pub participants: Vec<Participant>,
    pub strategy: Option<GroupSizeStrategy>,
    pub groups: Vec<Vec<usize>>,
    pub shared_outputs: Vec<SharedOutput>,
}

impl SwapPool {
    pub fn from_announcement(announcement: &PoolAnnouncement, creator_peer: String) -> Self {
        Self {
            pool_id: announcement.pool_id,
            denomination: announcement.denomination,
            min_participants: announcement.min_participants,
            max_participants: announcement.max_participants,
            fee_rate: announcement.fee_rate,
            burn_config: announcement.burn_config,
            setup_confirmations: announcement.setup_confirmations,
            settlement_confirmations: announcement.settlement_confirmations,
            creator_peer,
            creator_pub_key: announcement.creator_pub_key,
            created_at: announcement.created_at,
            phase: PoolPhase::Registration,
            participants: Vec::new(),
            strategy: None,
            groups: Vec::new(),
            shared_outputs: Vec::new(),
        }
    }

    pub fn find_participant(&self, signer_pub_key: &PublicKey) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| &p.signer_pub_key == signer_pub_key)
    }
}
