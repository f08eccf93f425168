//! Three-phase discovery (§4.4): signers advertise capability, an initiator
//! finds co-signers and announces a signing request, and every required
//! co-signer auto-joins as soon as it observes the request — converging, on
//! every participating peer independently, on one `SESSION_READY` event.
//!
//! This crate is the first layer allowed to touch the transport and directory
//! directly; `swapsig-musig2` stays decoupled from both and only hands back
//! [`swapsig_musig2::Effect`] values, which [`DiscoveryCoordinator`] executes.

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swapsig_core::wire::WireError;
use swapsig_core::{
    digest_parts, Advertisement, Capability, Digest32, LongTermKeypair, ModelError,
    SigningRequest, WireMessage,
};
use swapsig_directory::{Directory, DirectoryError, DirectoryKey};
use swapsig_musig2::session::{Effect, InboundMessage, SessionEvent, SessionRegistry};
use swapsig_musig2::MusigError;
use swapsig_transport::{BroadcastOptions, Transport, TransportError};
use thiserror::Error;

const MUSIG2_PROTOCOL: &str = "swapsig-musig2";
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 120;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Musig2(#[from] MusigError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("malformed cached payload: {0}")]
    MalformedPayload(String),
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn signer_topic(pubkey: &PublicKey) -> String {
    format!("signing-requests:{}", hex::encode(pubkey.serialize()))
}

/// Filters applied during `findAvailableSigners`.
#[derive(Clone, Debug)]
pub struct SignerFilter {
    pub transaction_type: String,
    pub min_amount: u64,
    pub max_amount: u64,
}

/// Observer-facing events a caller surfaces to its own higher layers (pool
/// orchestrator, logging, a UI). Distinct from `swapsig_musig2::SessionEvent`,
/// which stays internal to the wiring in this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    SigningRequestAnnounced(Digest32),
    Joined(Digest32),
    SessionReady(Digest32),
    SessionCompleted(Digest32),
    SessionAborted(Digest32, String),
}

/// The wire payload carried inside a `swapsig-musig2` protocol `WireMessage`.
/// Sequence numbers and signer indices travel with the payload itself, since
/// they're protocol state the generic envelope in `swapsig-core::wire` knows
/// nothing about.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Musig2WirePayload {
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

impl Musig2WirePayload {
    fn msg_type(&self) -> &'static str {
        match self {
            Musig2WirePayload::SessionJoin { .. } => "SESSION_JOIN",
            Musig2WirePayload::NonceShare { .. } => "NONCE_SHARE",
            Musig2WirePayload::PartialSigShare { .. } => "PARTIAL_SIG_SHARE",
            Musig2WirePayload::SessionAbort { .. } => "SESSION_ABORT",
        }
    }

    fn session_id(&self) -> Digest32 {
        match self {
            Musig2WirePayload::SessionJoin { session_id, .. }
            | Musig2WirePayload::NonceShare { session_id, .. }
            | Musig2WirePayload::PartialSigShare { session_id, .. }
            | Musig2WirePayload::SessionAbort { session_id, .. } => *session_id,
        }
    }
}

/// Ties the MuSig2 session core to a live transport and directory: executes
/// the session core's effects, decodes inbound wire traffic back into
/// `handle_inbound` calls, and runs the three discovery phases.
pub struct DiscoveryCoordinator {
    identity: LongTermKeypair,
    transport: Arc<dyn Transport>,
    directory: Arc<Directory>,
    musig2: Mutex<SessionRegistry>,
    ready_emitted: Mutex<HashSet<Digest32>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        identity: LongTermKeypair,
        transport: Arc<dyn Transport>,
        directory: Arc<Directory>,
    ) -> Self {
        Self {
            identity,
            transport,
            directory,
            musig2: Mutex::new(SessionRegistry::new()),
            ready_emitted: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to this node's own signing-request topic. Must be called once
    /// before any peer's `announce_signing_request` can reach us.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let topic = signer_topic(&self.identity.public_key());
        self.transport.subscribe(&topic).await?;
        Ok(())
    }

    /// Phase 0: build, sign, and publish a capability advertisement.
    pub async fn advertise_signer(
        &self,
        capability: Capability,
        metadata: Option<String>,
        ttl: Duration,
    ) -> Result<Advertisement, DiscoveryError> {
        let now = now_secs();
        let ad = Advertisement::new(
            &self.identity,
            self.transport.peer_id().to_string(),
            capability.clone(),
            metadata,
            now,
            now + ttl.as_secs().max(1),
        )?;
        let bytes =
            serde_json::to_vec(&ad).expect("advertisement is always json-serializable");

        self.directory
            .publish(&DirectoryKey::Signer(ad.signer_pub_key), bytes.clone(), ttl)
            .await?;
        for tx_type in &capability.tx_types {
            self.transport
                .publish(&format!("signers:{tx_type}"), &bytes)
                .await?;
        }
        log::info!("advertised signer capability for {:?}", capability.tx_types);
        Ok(ad)
    }

    /// Phase 1: scan the local directory cache for live, correctly-signed
    /// advertisements matching `filters`, deterministically ordered.
    pub fn find_available_signers(
        &self,
        filters: &SignerFilter,
        max_results: usize,
    ) -> Vec<Advertisement> {
        let now = now_secs();
        let mut matches: Vec<Advertisement> = self
            .directory
            .scan_cache()
            .into_iter()
            .filter_map(|bytes| serde_json::from_slice::<Advertisement>(&bytes).ok())
            .filter(|ad| ad.verify(now).is_ok())
            .filter(|ad| {
                ad.capability
                    .accepts(&filters.transaction_type, filters.min_amount)
                    && ad.capability.max_amount >= filters.max_amount
            })
            .collect();

        // Deterministic ordering: no reputation/fee metadata is modeled, so the
        // tie-break is the full ordering key — lexicographic on the signer's
        // compressed public key.
        matches.sort_by(|a, b| a.signer_pub_key.serialize().cmp(&b.signer_pub_key.serialize()));
        matches.truncate(max_results);
        matches
    }

    /// Phase 2: build and sign a signing request, then announce it. The
    /// session id is the request id — every required co-signer derives the
    /// same `MuSig2Session` from the request alone, without a separate
    /// session-descriptor fetch.
    pub async fn announce_signing_request(
        &self,
        required_pub_keys: Vec<PublicKey>,
        message: [u8; 32],
        metadata: Option<String>,
    ) -> Result<Digest32, DiscoveryError> {
        let now = now_secs();
        let request = SigningRequest::new(&self.identity, required_pub_keys, message, metadata, now)?;
        let request_id = request.request_id;

        self.register_and_join(&request, now)?;

        let bytes =
            serde_json::to_vec(&request).expect("signing request is always json-serializable");
        self.directory
            .publish(
                &DirectoryKey::SigningRequest(request_id),
                bytes.clone(),
                Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            )
            .await?;

        let envelope = WireMessage {
            protocol: "swapsig-discovery".to_string(),
            msg_type: "SIGNING_REQUEST_ANNOUNCE".to_string(),
            from: self.transport.peer_id().to_string(),
            to: None,
            payload: bytes,
            timestamp: now,
            message_id: digest_parts(&[request_id.as_bytes(), b"announce"]).to_hex(),
        };
        let encoded = envelope.encode()?;
        for pk in &request.required_pub_keys {
            self.transport.publish(&signer_topic(pk), &encoded).await?;
        }

        log::info!("announced signing request {}", hex::encode(request_id.as_bytes()));
        Ok(request_id)
    }

    /// Decode and handle an inbound `SIGNING_REQUEST_ANNOUNCE` payload (the
    /// `WireMessage::payload`, already stripped of its envelope). No-op if the
    /// local signer isn't among the required keys.
    pub async fn handle_signing_request_announcement(
        &self,
        payload: &[u8],
    ) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
        let request: SigningRequest = serde_json::from_slice(payload)
            .map_err(|e| DiscoveryError::MalformedPayload(e.to_string()))?;
        request.verify()?;

        let my_pubkey = self.identity.public_key();
        if !request.required_pub_keys.contains(&my_pubkey) {
            return Ok(Vec::new());
        }

        let now = now_secs();
        let effects = self.register_and_join(&request, now)?;
        let mut events = vec![DiscoveryEvent::Joined(request.request_id)];
        events.extend(self.dispatch_effects(request.request_id, effects).await?);
        Ok(events)
    }

    /// Create (if needed) and join the MuSig2 session backing a signing
    /// request, returning the effects from the join call only (creation itself
    /// never broadcasts — see `SessionRegistry::create_session_with_id`).
    fn register_and_join(
        &self,
        request: &SigningRequest,
        now: u64,
    ) -> Result<Vec<Effect>, DiscoveryError> {
        let mut registry = self.musig2.lock().unwrap();
        registry.create_session_with_id(
            request.request_id,
            request.required_pub_keys.clone(),
            self.identity.secret_key(),
            request.message,
            request.metadata.clone(),
            false,
            now,
            now + DEFAULT_SESSION_TIMEOUT_SECS,
        )?;
        let effects = registry.join_session(request.request_id, self.identity.secret_key())?;
        Ok(effects)
    }

    /// Decode an inbound `swapsig-musig2` protocol message and feed it to the
    /// session registry, returning any resulting discovery-level events.
    pub async fn handle_musig2_message(
        &self,
        payload: &[u8],
    ) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
        let envelope = WireMessage::decode(payload)?;
        let parsed: Musig2WirePayload = serde_json::from_slice(&envelope.payload)
            .map_err(|e| DiscoveryError::MalformedPayload(e.to_string()))?;
        let session_id = parsed.session_id();

        let effects = {
            let mut registry = self.musig2.lock().unwrap();
            match parsed {
                Musig2WirePayload::SessionJoin {
                    session_id,
                    signer_index,
                    sequence,
                } => registry.handle_inbound(
                    session_id,
                    signer_index,
                    sequence,
                    InboundMessage::SessionJoin { signer_index },
                )?,
                Musig2WirePayload::NonceShare {
                    session_id,
                    signer_index,
                    sequence,
                    pub_nonce,
                } => registry.handle_inbound(
                    session_id,
                    signer_index,
                    sequence,
                    InboundMessage::NonceShare { pub_nonce },
                )?,
                Musig2WirePayload::PartialSigShare {
                    session_id,
                    signer_index,
                    sequence,
                    partial_sig,
                } => registry.handle_inbound(
                    session_id,
                    signer_index,
                    sequence,
                    InboundMessage::PartialSigShare { partial_sig },
                )?,
                // Abort carries no sequence number on the wire and bypasses
                // replay gating in `handle_inbound`, so this value is unused.
                Musig2WirePayload::SessionAbort { session_id, reason } => registry
                    .handle_inbound(session_id, 0, 0, InboundMessage::SessionAbort { reason })?,
            }
        };
        self.dispatch_effects(session_id, effects).await
    }

    /// Drive a signer's own two signing rounds forward once its session's
    /// preconditions are met. Callers typically invoke these after observing
    /// `DiscoveryEvent::SessionReady` (round 1) and after their own nonces are
    /// all in (round 2) — both calls are idempotent no-ops otherwise.
    pub async fn start_round1(&self, session_id: Digest32) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
        let effects = {
            let mut registry = self.musig2.lock().unwrap();
            registry.start_round1(session_id, self.identity.secret_key())?
        };
        self.dispatch_effects(session_id, effects).await
    }

    pub async fn start_round2(&self, session_id: Digest32) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
        let effects = {
            let mut registry = self.musig2.lock().unwrap();
            registry.start_round2(session_id, self.identity.secret_key())?
        };
        self.dispatch_effects(session_id, effects).await
    }

    pub fn final_signature(&self, session_id: Digest32) -> Result<[u8; 64], DiscoveryError> {
        Ok(self.musig2.lock().unwrap().get_final_signature(session_id)?)
    }

    async fn dispatch_effects(
        &self,
        session_id: Digest32,
        effects: Vec<Effect>,
    ) -> Result<Vec<DiscoveryEvent>, DiscoveryError> {
        let mut events = Vec::new();
        for effect in effects {
            match effect {
                Effect::Broadcast(msg) => {
                    let (signer_index, sequence, inner) = match &msg {
                        swapsig_musig2::session::OutboundMessage::SessionJoin {
                            signer_index,
                            sequence,
                            ..
                        } => (
                            *signer_index,
                            *sequence,
                            Musig2WirePayload::SessionJoin {
                                session_id,
                                signer_index: *signer_index,
                                sequence: *sequence,
                            },
                        ),
                        swapsig_musig2::session::OutboundMessage::NonceShare {
                            signer_index,
                            sequence,
                            pub_nonce,
                            ..
                        } => (
                            *signer_index,
                            *sequence,
                            Musig2WirePayload::NonceShare {
                                session_id,
                                signer_index: *signer_index,
                                sequence: *sequence,
                                pub_nonce: pub_nonce.clone(),
                            },
                        ),
                        swapsig_musig2::session::OutboundMessage::PartialSigShare {
                            signer_index,
                            sequence,
                            partial_sig,
                            ..
                        } => (
                            *signer_index,
                            *sequence,
                            Musig2WirePayload::PartialSigShare {
                                session_id,
                                signer_index: *signer_index,
                                sequence: *sequence,
                                partial_sig: *partial_sig,
                            },
                        ),
                        swapsig_musig2::session::OutboundMessage::SessionAbort { reason, .. } => (
                            0,
                            0,
                            Musig2WirePayload::SessionAbort {
                                session_id,
                                reason: reason.clone(),
                            },
                        ),
                    };
                    let _ = (signer_index, sequence);
                    let payload_bytes = serde_json::to_vec(&inner)
                        .expect("musig2 wire payload is always json-serializable");
                    let envelope = WireMessage {
                        protocol: MUSIG2_PROTOCOL.to_string(),
                        msg_type: inner.msg_type().to_string(),
                        from: self.transport.peer_id().to_string(),
                        to: None,
                        payload: payload_bytes,
                        timestamp: now_secs(),
                        message_id: digest_parts(&[session_id.as_bytes(), inner.msg_type().as_bytes()])
                            .to_hex(),
                    };
                    let encoded = envelope.encode()?;
                    self.transport
                        .broadcast(MUSIG2_PROTOCOL, &encoded, BroadcastOptions::default())
                        .await?;
                }
                Effect::PublishSessionDescriptor { session_id, bytes } => {
                    self.directory
                        .publish(
                            &DirectoryKey::Session(session_id),
                            bytes,
                            Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
                        )
                        .await?;
                }
                Effect::Event(SessionEvent::Created(_)) => {}
                Effect::Event(SessionEvent::AllSignersJoined(id)) => {
                    if self.ready_emitted.lock().unwrap().insert(id) {
                        log::info!("session {} ready: all signers joined", hex::encode(id.as_bytes()));
                        events.push(DiscoveryEvent::SessionReady(id));
                    }
                }
                Effect::Event(SessionEvent::Completed(id)) => {
                    events.push(DiscoveryEvent::SessionCompleted(id));
                }
                Effect::Event(SessionEvent::Aborted(id, reason)) => {
                    log::warn!("session {} aborted: {reason}", hex::encode(id.as_bytes()));
                    events.push(DiscoveryEvent::SessionAborted(id, reason));
                }
            }
        }
        Ok(events)
    }
}
