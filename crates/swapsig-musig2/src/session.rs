//! Per-session state machine: phases `{INIT, NONCE_EXCHANGE, PARTIAL_SIG_EXCHANGE,
//! COMPLETE, ABORTED}`, strict phase-gated message acceptance, per-signer replay
//! protection, and local, talk-to-nobody finalization once every partial
//! signature has arrived.
//!
//! A session never drives its own I/O: every operation returns a list of
//! [`Effect`]s (messages to broadcast, a descriptor to publish, an event to
//! surface) that the caller — `swapsig-discovery` or `swapsig-pool` — executes
//! against the transport and directory. This keeps the session core free of any
//! async or transport dependency, matching the "per-session maps, explicit
//! callback channels" design used by the higher layers.

use crate::primitives::{
    aggregate_nonces, aggregate_signatures, generate_nonce, key_agg, key_agg_tweaked,
    partial_sign, pubnonce_from_bytes, pubnonce_to_bytes, MusigError,
};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use musig2::{AggNonce, KeyAggContext, PartialSignature, PubNonce, SecNonce};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use swapsig_core::{digest_parts, Digest32};
use zeroize::Zeroize;

/// Default bound on how far ahead of the last accepted sequence number an
/// inbound message may be (§4.3 replay protection).
pub const DEFAULT_MAX_SEQUENCE_GAP: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    NonceExchange,
    PartialSigExchange,
    Complete,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageKind {
    Join,
    Nonce,
    PartialSig,
    Abort,
}

impl MessageKind {
    fn allowed_in(self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (MessageKind::Join, Phase::Init)
                | (MessageKind::Nonce, Phase::NonceExchange)
                | (MessageKind::PartialSig, Phase::PartialSigExchange)
                | (MessageKind::Abort, _)
        )
    }
}

/// An inbound protocol message for one session, already decoded from the wire
/// envelope's payload.
#[derive(Clone, Debug)]
pub enum InboundMessage {
    SessionJoin { signer_index: usize },
    NonceShare { pub_nonce: Vec<u8> },
    PartialSigShare { partial_sig: [u8; 32] },
    SessionAbort { reason: String },
}

impl InboundMessage {
    fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::SessionJoin { .. } => MessageKind::Join,
            InboundMessage::NonceShare { .. } => MessageKind::Nonce,
            InboundMessage::PartialSigShare { .. } => MessageKind::PartialSig,
            InboundMessage::SessionAbort { .. } => MessageKind::Abort,
        }
    }
}

/// A message this session wants broadcast to the other signers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    SessionJoin {
        session_id: Digest32,
        signer_index: usize,
        sequence: u64,
    },
    NonceShare {
        session_id: Digest32,
        signer_index: usize,
        sequence: u64,
        pub_nonce: Vec<u8>,
    },
    PartialSigShare {
        session_id: Digest32,
        signer_index: usize,
        sequence: u64,
        partial_sig: [u8; 32],
    },
    SessionAbort {
        session_id: Digest32,
        reason: String,
    },
}

/// A local-only notification: no wire message, just something the caller may
/// want to log or act on (publish a descriptor update, surface to a UI, etc).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Created(Digest32),
    AllSignersJoined(Digest32),
    Completed(Digest32),
    Aborted(Digest32, String),
}

/// Everything an operation on a session can ask the caller to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    PublishSessionDescriptor { session_id: Digest32, bytes: Vec<u8> },
    Broadcast(OutboundMessage),
    Event(SessionEvent),
}

/// Wire-independent record of a session, fetched via the directory so a peer
/// that didn't create the session can still join it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: Digest32,
    pub signers: Vec<PublicKey>,
    pub message: [u8; 32],
    pub metadata: Option<String>,
    pub taproot_tweak: bool,
    pub deadline: u64,
}

impl SessionDescriptor {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("session descriptor is always serializable")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MusigError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MusigError::Signing(format!("bad session descriptor: {e}")))
    }
}

/// One MuSig2 signing operation's worth of state, as seen by the local signer.
pub struct MuSig2Session {
    pub session_id: Digest32,
    pub signers: Vec<PublicKey>,
    pub my_index: Option<usize>,
    pub message: [u8; 32],
    pub phase: Phase,
    pub created_at: u64,
    pub deadline: u64,
    key_agg_ctx: KeyAggContext,
    aggregated_xonly: XOnlyPublicKey,
    joined: HashSet<usize>,
    my_secret_nonce: Option<SecNonce>,
    my_public_nonce: Option<PubNonce>,
    received_nonces: HashMap<usize, PubNonce>,
    aggregated_nonce: Option<AggNonce>,
    my_partial_sig: Option<PartialSignature>,
    received_partial_sigs: HashMap<usize, PartialSignature>,
    final_signature: Option<[u8; 64]>,
    last_sequence_numbers: HashMap<usize, u64>,
    my_outbound_sequence: u64,
    max_sequence_gap: u64,
    replay_protection_enabled: bool,
}

impl MuSig2Session {
    pub fn aggregated_pubkey(&self) -> XOnlyPublicKey {
        self.aggregated_xonly
    }

    fn next_seq(&mut self) -> u64 {
        self.my_outbound_sequence += 1;
        self.my_outbound_sequence
    }

    fn check_and_advance_sequence(&mut self, from: usize, sequence: u64) -> Result<(), MusigError> {
        if !self.replay_protection_enabled {
            return Ok(());
        }
        let last = self.last_sequence_numbers.get(&from).copied().unwrap_or(0);
        if sequence <= last || sequence - last > self.max_sequence_gap {
            return Err(MusigError::InvalidSequenceNumber {
                index: from,
                got: sequence,
                last,
            });
        }
        self.last_sequence_numbers.insert(from, sequence);
        Ok(())
    }

    /// Try to finalize once every partial signature (including our own) is in.
    fn try_finalize(&mut self) -> Vec<Effect> {
        let have_all = self.my_partial_sig.is_some()
            && self.received_partial_sigs.len() == self.signers.len() - 1;
        if !have_all {
            return Vec::new();
        }
        let agg_nonce = match &self.aggregated_nonce {
            Some(n) => n.clone(),
            None => return Vec::new(),
        };
        let ordered: Vec<PartialSignature> = (0..self.signers.len())
            .map(|i| {
                if Some(i) == self.my_index {
                    self.my_partial_sig.unwrap()
                } else {
                    self.received_partial_sigs[&i]
                }
            })
            .collect();

        match aggregate_signatures(&self.key_agg_ctx, &agg_nonce, &ordered, &self.message)
            .ok()
            .filter(|sig| {
                crate::primitives::verify_aggregated_signature(
                    &self.aggregated_xonly,
                    sig,
                    &self.message,
                )
            }) {
            Some(sig) => {
                self.phase = Phase::Complete;
                self.final_signature = Some(sig);
                vec![Effect::Event(SessionEvent::Completed(self.session_id))]
            }
            None => {
                self.phase = Phase::Aborted;
                vec![Effect::Event(SessionEvent::Aborted(
                    self.session_id,
                    "AggregationMismatch".to_string(),
                ))]
            }
        }
    }
}

impl Drop for MuSig2Session {
    fn drop(&mut self) {
        // SecNonce has no public zeroizing constructor in the musig2 crate, so we
        // drop it as early as possible (see `start_round2`) and only rely on this
        // for the case a session is destroyed before reaching round 2.
        self.my_secret_nonce = None;
    }
}

/// Owns every live session by id. The coordinator's single point of mutation
/// for MuSig2 protocol state, matching the "no two tasks mutate the same
/// session at once" concurrency rule.
pub struct SessionRegistry {
    sessions: HashMap<Digest32, MuSig2Session>,
    max_sequence_gap: u64,
    replay_protection_enabled: bool,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            max_sequence_gap: DEFAULT_MAX_SEQUENCE_GAP,
            replay_protection_enabled: true,
        }
    }

    /// Disable replay protection globally. Test-harness only (§4.3).
    pub fn disable_replay_protection(&mut self) {
        self.replay_protection_enabled = false;
    }

    pub fn get(&self, session_id: &Digest32) -> Option<&MuSig2Session> {
        self.sessions.get(session_id)
    }

    fn local_pubkey(priv_key: &SecretKey) -> PublicKey {
        let secp = Secp256k1::new();
        priv_key.public_key(&secp)
    }

    fn build_session(
        signers: Vec<PublicKey>,
        my_index: Option<usize>,
        message: [u8; 32],
        metadata: Option<String>,
        taproot_tweak: bool,
        created_at: u64,
        deadline: u64,
        max_sequence_gap: u64,
        replay_protection_enabled: bool,
    ) -> Result<(Digest32, MuSig2Session), MusigError> {
        let (key_agg_ctx, aggregated_xonly) = if taproot_tweak {
            key_agg_tweaked(&signers)?
        } else {
            key_agg(&signers)?
        };

        let mut nonce_seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_seed);
        let mut signer_bytes = Vec::new();
        for pk in &signers {
            signer_bytes.extend_from_slice(&pk.serialize());
        }
        let metadata_bytes = metadata.as_deref().unwrap_or("").as_bytes();
        let session_id = digest_parts(&[&signer_bytes, &message, &nonce_seed, metadata_bytes]);
        nonce_seed.zeroize();

        let mut joined = HashSet::new();
        if let Some(idx) = my_index {
            joined.insert(idx);
        }

        let session = MuSig2Session {
            session_id,
            signers,
            my_index,
            message,
            phase: Phase::Init,
            created_at,
            deadline,
            key_agg_ctx,
            aggregated_xonly,
            joined,
            my_secret_nonce: None,
            my_public_nonce: None,
            received_nonces: HashMap::new(),
            aggregated_nonce: None,
            my_partial_sig: None,
            received_partial_sigs: HashMap::new(),
            final_signature: None,
            last_sequence_numbers: HashMap::new(),
            my_outbound_sequence: 0,
            max_sequence_gap,
            replay_protection_enabled,
        };
        Ok((session_id, session))
    }

    /// `createSession`: the local signer originates a new MuSig2 operation.
    /// Fails with `NotAParticipant` unless `myPrivKey.pub` is in `signers`.
    pub fn create_session(
        &mut self,
        signers: Vec<PublicKey>,
        my_priv_key: &SecretKey,
        message: [u8; 32],
        metadata: Option<String>,
        taproot_tweak: bool,
        now: u64,
        deadline: u64,
    ) -> Result<(Digest32, Vec<Effect>), MusigError> {
        let my_pubkey = Self::local_pubkey(my_priv_key);
        let my_index = signers
            .iter()
            .position(|pk| pk == &my_pubkey)
            .ok_or(MusigError::NotAParticipant)?;

        let (session_id, session) = Self::build_session(
            signers,
            Some(my_index),
            message,
            metadata.clone(),
            taproot_tweak,
            now,
            deadline,
            self.max_sequence_gap,
            self.replay_protection_enabled,
        )?;

        let descriptor = SessionDescriptor {
            session_id,
            signers: session.signers.clone(),
            message,
            metadata,
            taproot_tweak,
            deadline,
        };
        self.sessions.insert(session_id, session);

        Ok((
            session_id,
            vec![
                Effect::Event(SessionEvent::Created(session_id)),
                Effect::PublishSessionDescriptor {
                    session_id,
                    bytes: descriptor.encode(),
                },
            ],
        ))
    }

    /// Register a session under an externally-assigned id (used when the
    /// session id is derived from something both peers already agree on, such
    /// as a signing request id, rather than minted fresh by a creator). Every
    /// peer — including whichever one originated the signing request — still
    /// has to call [`SessionRegistry::join_session`] afterwards to broadcast
    /// its own `SESSION_JOIN`. No-op if the session is already locally known.
    pub fn create_session_with_id(
        &mut self,
        session_id: Digest32,
        signers: Vec<PublicKey>,
        my_priv_key: &SecretKey,
        message: [u8; 32],
        metadata: Option<String>,
        taproot_tweak: bool,
        now: u64,
        deadline: u64,
    ) -> Result<(), MusigError> {
        if self.sessions.contains_key(&session_id) {
            return Ok(());
        }
        let my_pubkey = Self::local_pubkey(my_priv_key);
        let my_index = signers
            .iter()
            .position(|pk| pk == &my_pubkey)
            .ok_or(MusigError::NotAParticipant)?;
        let (_, mut session) = Self::build_session(
            signers,
            None,
            message,
            metadata,
            taproot_tweak,
            now,
            deadline,
            self.max_sequence_gap,
            self.replay_protection_enabled,
        )?;
        session.session_id = session_id;
        session.my_index = Some(my_index);
        self.sessions.insert(session_id, session);
        Ok(())
    }

    /// Register a session this peer didn't create, from a descriptor fetched out
    /// of the directory. No-op if the session is already locally known.
    pub fn register_from_descriptor(
        &mut self,
        descriptor: SessionDescriptor,
        now: u64,
    ) -> Result<(), MusigError> {
        if self.sessions.contains_key(&descriptor.session_id) {
            return Ok(());
        }
        let (_, mut session) = Self::build_session(
            descriptor.signers,
            None,
            descriptor.message,
            descriptor.metadata,
            descriptor.taproot_tweak,
            now,
            descriptor.deadline,
            self.max_sequence_gap,
            self.replay_protection_enabled,
        )?;
        session.session_id = descriptor.session_id;
        self.sessions.insert(descriptor.session_id, session);
        Ok(())
    }

    /// `joinSession`: register the local signer's presence and broadcast
    /// `SESSION_JOIN`. Fails with `SessionNotFound`, `NotAParticipant`, or
    /// `WrongPhase` if the session is past INIT.
    pub fn join_session(
        &mut self,
        session_id: Digest32,
        my_priv_key: &SecretKey,
    ) -> Result<Vec<Effect>, MusigError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(MusigError::SessionNotFound)?;
        if session.phase != Phase::Init {
            return Err(MusigError::WrongPhase);
        }
        let my_pubkey = Self::local_pubkey(my_priv_key);
        let my_index = match session.my_index {
            Some(idx) => idx,
            None => {
                let idx = session
                    .signers
                    .iter()
                    .position(|pk| pk == &my_pubkey)
                    .ok_or(MusigError::NotAParticipant)?;
                session.my_index = Some(idx);
                idx
            }
        };
        if session.joined.contains(&my_index) {
            return Ok(Vec::new());
        }
        session.joined.insert(my_index);
        let sequence = session.next_seq();
        let mut effects = vec![Effect::Broadcast(OutboundMessage::SessionJoin {
            session_id,
            signer_index: my_index,
            sequence,
        })];
        if session.joined.len() == session.signers.len() {
            effects.push(Effect::Event(SessionEvent::AllSignersJoined(session_id)));
        }
        Ok(effects)
    }

    /// `startRound1`: generate and broadcast our nonce. Idempotent.
    pub fn start_round1(
        &mut self,
        session_id: Digest32,
        my_priv_key: &SecretKey,
    ) -> Result<Vec<Effect>, MusigError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(MusigError::SessionNotFound)?;
        if session.phase == Phase::NonceExchange && session.my_public_nonce.is_some() {
            return Ok(Vec::new());
        }
        if session.phase != Phase::Init {
            return Err(MusigError::WrongPhase);
        }
        if session.joined.len() != session.signers.len() {
            return Err(MusigError::WrongPhase);
        }
        let my_index = session.my_index.ok_or(MusigError::NotAParticipant)?;

        let (secnonce, pubnonce) =
            generate_nonce(my_priv_key, &session.key_agg_ctx, &session.message)?;
        session.my_secret_nonce = Some(secnonce);
        session.my_public_nonce = Some(pubnonce.clone());
        session.phase = Phase::NonceExchange;

        let sequence = session.next_seq();
        Ok(vec![Effect::Broadcast(OutboundMessage::NonceShare {
            session_id,
            signer_index: my_index,
            sequence,
            pub_nonce: pubnonce_to_bytes(&pubnonce),
        })])
    }

    /// `startRound2`: aggregate nonces, compute our partial signature, broadcast
    /// it. Idempotent. Erases the secret nonce the instant it's consumed.
    pub fn start_round2(
        &mut self,
        session_id: Digest32,
        my_priv_key: &SecretKey,
    ) -> Result<Vec<Effect>, MusigError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(MusigError::SessionNotFound)?;
        if session.phase == Phase::PartialSigExchange && session.my_partial_sig.is_some() {
            return Ok(Vec::new());
        }
        if session.phase != Phase::NonceExchange {
            return Err(MusigError::WrongPhase);
        }
        if session.received_nonces.len() != session.signers.len() - 1 {
            return Err(MusigError::WrongPhase);
        }
        let my_index = session.my_index.ok_or(MusigError::NotAParticipant)?;
        let my_pubnonce = session
            .my_public_nonce
            .clone()
            .ok_or(MusigError::WrongPhase)?;
        let secnonce = session
            .my_secret_nonce
            .take()
            .ok_or(MusigError::WrongPhase)?;

        let ordered_nonces: Vec<PubNonce> = (0..session.signers.len())
            .map(|i| {
                if i == my_index {
                    my_pubnonce.clone()
                } else {
                    session.received_nonces[&i].clone()
                }
            })
            .collect();
        let agg_nonce = aggregate_nonces(&ordered_nonces);
        session.aggregated_nonce = Some(agg_nonce.clone());

        let partial = partial_sign(
            my_priv_key,
            secnonce,
            &session.key_agg_ctx,
            &agg_nonce,
            &session.message,
        )?;
        session.my_partial_sig = Some(partial);
        session.phase = Phase::PartialSigExchange;

        let sequence = session.next_seq();
        let mut effects = vec![Effect::Broadcast(OutboundMessage::PartialSigShare {
            session_id,
            signer_index: my_index,
            sequence,
            partial_sig: crate::primitives::partial_sig_to_bytes(&partial),
        })];
        effects.extend(session.try_finalize());
        Ok(effects)
    }

    /// `getFinalSignature`: fails with `NotComplete` unless phase is COMPLETE.
    pub fn get_final_signature(&self, session_id: Digest32) -> Result<[u8; 64], MusigError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or(MusigError::SessionNotFound)?;
        if session.phase != Phase::Complete {
            return Err(MusigError::NotComplete);
        }
        session.final_signature.ok_or(MusigError::NotComplete)
    }

    /// `abort`: idempotent transition to ABORTED.
    pub fn abort(&mut self, session_id: Digest32, reason: &str) -> Result<Vec<Effect>, MusigError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(MusigError::SessionNotFound)?;
        if session.phase == Phase::Aborted {
            return Ok(Vec::new());
        }
        session.phase = Phase::Aborted;
        session.my_secret_nonce = None;
        Ok(vec![
            Effect::Broadcast(OutboundMessage::SessionAbort {
                session_id,
                reason: reason.to_string(),
            }),
            Effect::Event(SessionEvent::Aborted(session_id, reason.to_string())),
        ])
    }

    /// Feed one inbound, already-decoded session message through phase gating,
    /// replay protection, and dispatch.
    pub fn handle_inbound(
        &mut self,
        session_id: Digest32,
        from_index: usize,
        sequence: u64,
        msg: InboundMessage,
    ) -> Result<Vec<Effect>, MusigError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(MusigError::SessionNotFound)?;

        if !msg.kind().allowed_in(session.phase) {
            return Err(MusigError::ProtocolViolation);
        }
        // An abort must land in any phase regardless of replay state: a
        // straggler that never advanced its sequence number still has to be
        // able to tear the session down for everyone else.
        if !matches!(msg, InboundMessage::SessionAbort { .. }) {
            session.check_and_advance_sequence(from_index, sequence)?;
        }

        match msg {
            InboundMessage::SessionJoin { signer_index } => {
                session.joined.insert(signer_index);
                if session.joined.len() == session.signers.len() {
                    Ok(vec![Effect::Event(SessionEvent::AllSignersJoined(
                        session_id,
                    ))])
                } else {
                    Ok(Vec::new())
                }
            }
            InboundMessage::NonceShare { pub_nonce } => {
                let pn = pubnonce_from_bytes(&pub_nonce)?;
                session.received_nonces.insert(from_index, pn);
                Ok(Vec::new())
            }
            InboundMessage::PartialSigShare { partial_sig } => {
                let ps = crate::primitives::partial_sig_from_bytes(&partial_sig)?;
                session.received_partial_sigs.insert(from_index, ps);
                Ok(session.try_finalize())
            }
            InboundMessage::SessionAbort { reason } => {
                session.phase = Phase::Aborted;
                session.my_secret_nonce = None;
                Ok(vec![Effect::Event(SessionEvent::Aborted(
                    session_id, reason,
                ))])
            }
        }
    }

    /// Abort any session past its deadline and still live. Called periodically
    /// by the coordinator's timer loop.
    pub fn sweep_timeouts(&mut self, now: u64) -> Vec<(Digest32, Vec<Effect>)> {
        let expired: Vec<Digest32> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                now > s.deadline && !matches!(s.phase, Phase::Complete | Phase::Aborted)
            })
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .map(|id| {
                let effects = self.abort(id, "PhaseTimeout").unwrap_or_default();
                (id, effects)
            })
            .collect()
    }
}
