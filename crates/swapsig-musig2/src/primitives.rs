//! MuSig2 (BIP-327) n-of-n key aggregation and two-round signing.
//!
//! Bridges our secp256k1 0.29/0.29 types to the `musig2` crate's own secp256k1
//! build via byte serialization; both sit on top of libsecp256k1 so the points
//! and scalars are identical, only the Rust types differ.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use musig2::{AggNonce, KeyAggContext, LiftedSignature, PartialSignature, PubNonce, SecNonce};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MusigError {
    #[error("key aggregation failed: {0}")]
    KeyAggregation(String),
    #[error("taproot tweak failed: {0}")]
    TaprootTweak(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid nonce encoding: {0}")]
    InvalidNonce(String),
    #[error("invalid partial signature encoding: {0}")]
    InvalidPartialSig(String),
    #[error("local signer not a member of the signer set")]
    NotAParticipant,
    #[error("session not found")]
    SessionNotFound,
    #[error("operation not allowed in the current phase")]
    WrongPhase,
    #[error("message type not allowed in the current phase")]
    ProtocolViolation,
    #[error("sequence number {got} from signer {index} is not greater than last accepted {last}, or exceeds the max gap")]
    InvalidSequenceNumber { index: usize, got: u64, last: u64 },
    #[error("session is not complete")]
    NotComplete,
    #[error("aggregated signature failed verification against the aggregated public key")]
    AggregationMismatch,
}

fn pubkey_to_musig(pk: &PublicKey) -> Result<musig2::secp256k1::PublicKey, MusigError> {
    musig2::secp256k1::PublicKey::from_slice(&pk.serialize())
        .map_err(|e| MusigError::KeyAggregation(format!("pubkey conversion: {e}")))
}

fn seckey_to_musig(sk: &SecretKey) -> Result<musig2::secp256k1::SecretKey, MusigError> {
    #[allow(deprecated)]
    musig2::secp256k1::SecretKey::from_slice(&sk.secret_bytes())
        .map_err(|e| MusigError::Signing(format!("seckey conversion: {e}")))
}

/// Aggregate an ordered signer set into a [`KeyAggContext`] and its x-only point.
/// Order matters: it is part of the aggregation context, fixed at session creation.
pub fn key_agg(signers: &[PublicKey]) -> Result<(KeyAggContext, XOnlyPublicKey), MusigError> {
    let musig_keys: Result<Vec<_>, _> = signers.iter().map(pubkey_to_musig).collect();
    let ctx = KeyAggContext::new(musig_keys?)
        .map_err(|e| MusigError::KeyAggregation(e.to_string()))?;
    let xonly = xonly_of(&ctx)?;
    Ok((ctx, xonly))
}

/// Same as [`key_agg`] but applies the BIP-341 unspendable-script-path Taproot
/// tweak, so the aggregation context signs for the on-chain output key `Q`, not
/// the internal key `P`.
pub fn key_agg_tweaked(
    signers: &[PublicKey],
) -> Result<(KeyAggContext, XOnlyPublicKey), MusigError> {
    let musig_keys: Result<Vec<_>, _> = signers.iter().map(pubkey_to_musig).collect();
    let ctx = KeyAggContext::new(musig_keys?)
        .map_err(|e| MusigError::KeyAggregation(e.to_string()))?;
    let tweaked = ctx
        .with_unspendable_taproot_tweak()
        .map_err(|e| MusigError::TaprootTweak(e.to_string()))?;
    let xonly = xonly_of(&tweaked)?;
    Ok((tweaked, xonly))
}

fn xonly_of(ctx: &KeyAggContext) -> Result<XOnlyPublicKey, MusigError> {
    let agg_pk: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    let (xonly, _parity) = agg_pk.x_only_public_key();
    XOnlyPublicKey::from_slice(&xonly.serialize())
        .map_err(|e| MusigError::KeyAggregation(format!("xonly conversion: {e}")))
}

/// Generate a fresh nonce pair. The returned [`SecNonce`] must be used exactly
/// once, for exactly this message, and then dropped — reuse leaks the secret key.
pub fn generate_nonce(
    seckey: &SecretKey,
    key_agg_ctx: &KeyAggContext,
    message: &[u8; 32],
) -> Result<(SecNonce, PubNonce), MusigError> {
    let sk_m = seckey_to_musig(seckey)?;
    let agg_pk: musig2::secp256k1::PublicKey = key_agg_ctx.aggregated_pubkey();

    let mut nonce_seed = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_seed);

    let secnonce = SecNonce::build(nonce_seed)
        .with_seckey(sk_m)
        .with_aggregated_pubkey(agg_pk)
        .with_message(&message[..])
        .build();
    let pubnonce = secnonce.public_nonce();
    Ok((secnonce, pubnonce))
}

pub fn aggregate_nonces(pubnonces: &[PubNonce]) -> AggNonce {
    AggNonce::sum(pubnonces)
}

/// Produce a partial signature. Consumes `secnonce` so it cannot be reused by
/// the caller.
pub fn partial_sign(
    seckey: &SecretKey,
    secnonce: SecNonce,
    key_agg_ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    message: &[u8; 32],
) -> Result<PartialSignature, MusigError> {
    let sk_m = seckey_to_musig(seckey)?;
    musig2::sign_partial(key_agg_ctx, sk_m, secnonce, agg_nonce, message)
        .map_err(|e| MusigError::Signing(e.to_string()))
}

pub fn verify_partial_signature(
    key_agg_ctx: &KeyAggContext,
    partial_sig: &PartialSignature,
    agg_nonce: &AggNonce,
    signer_pubkey: &PublicKey,
    signer_pubnonce: &PubNonce,
    message: &[u8; 32],
) -> bool {
    let pk_m = match pubkey_to_musig(signer_pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    musig2::verify_partial(
        key_agg_ctx,
        *partial_sig,
        agg_nonce,
        pk_m,
        signer_pubnonce,
        message,
    )
    .is_ok()
}

/// Sum partial signatures into the final 64-byte BIP-340 Schnorr signature.
pub fn aggregate_signatures(
    key_agg_ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    partial_sigs: &[PartialSignature],
    message: &[u8; 32],
) -> Result<[u8; 64], MusigError> {
    let sig: LiftedSignature =
        musig2::aggregate_partial_signatures(key_agg_ctx, agg_nonce, partial_sigs.iter().copied(), message)
            .map_err(|e| MusigError::Signing(e.to_string()))?;
    Ok(sig.serialize())
}

pub fn verify_aggregated_signature(
    aggregate_xonly: &XOnlyPublicKey,
    signature: &[u8; 64],
    message: &[u8; 32],
) -> bool {
    let secp = Secp256k1::verification_only();
    let sig = match bitcoin::secp256k1::schnorr::Signature::from_slice(signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let msg = bitcoin::secp256k1::Message::from_digest(*message);
    let xonly = match bitcoin::secp256k1::XOnlyPublicKey::from_slice(&aggregate_xonly.serialize()) {
        Ok(x) => x,
        Err(_) => return false,
    };
    secp.verify_schnorr(&sig, &msg, &xonly).is_ok()
}

pub fn pubnonce_to_bytes(pubnonce: &PubNonce) -> Vec<u8> {
    pubnonce.serialize().to_vec()
}

pub fn pubnonce_from_bytes(bytes: &[u8]) -> Result<PubNonce, MusigError> {
    PubNonce::from_bytes(bytes).map_err(|e| MusigError::InvalidNonce(e.to_string()))
}

pub fn partial_sig_to_bytes(sig: &PartialSignature) -> [u8; 32] {
    sig.serialize()
}

pub fn partial_sig_from_bytes(bytes: &[u8; 32]) -> Result<PartialSignature, MusigError> {
    PartialSignature::from_slice(bytes).map_err(|e| MusigError::InvalidPartialSig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    fn keypair(seed: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        bytes[31] = seed;
        let sk = SecretKey::from_slice(&bytes).unwrap();
        let pk = sk.public_key(&secp);
        (sk, pk)
    }

    #[test]
    fn three_party_key_aggregation_is_deterministic_in_order() {
        let (_a_sk, a_pk) = keypair(1);
        let (_b_sk, b_pk) = keypair(2);
        let (_c_sk, c_pk) = keypair(3);

        let (_ctx1, xonly1) = key_agg(&[a_pk, b_pk, c_pk]).unwrap();
        let (_ctx2, xonly2) = key_agg(&[a_pk, b_pk, c_pk]).unwrap();
        assert_eq!(xonly1, xonly2);

        let (_ctx3, xonly3) = key_agg(&[b_pk, a_pk, c_pk]).unwrap();
        assert_ne!(xonly1, xonly3, "aggregation context is order-sensitive");
    }

    #[test]
    fn three_party_full_signing_roundtrip() {
        let (a_sk, a_pk) = keypair(1);
        let (b_sk, b_pk) = keypair(2);
        let (c_sk, c_pk) = keypair(3);
        let signers = [a_pk, b_pk, c_pk];
        let seckeys = [a_sk, b_sk, c_sk];

        let (ctx, agg_xonly) = key_agg(&signers).unwrap();
        let message = [0xABu8; 32];

        let nonces: Vec<_> = seckeys
            .iter()
            .map(|sk| generate_nonce(sk, &ctx, &message).unwrap())
            .collect();
        let pubnonces: Vec<_> = nonces.iter().map(|(_, pn)| pn.clone()).collect();
        let agg_nonce = aggregate_nonces(&pubnonces);

        let partials: Vec<_> = nonces
            .into_iter()
            .zip(seckeys.iter())
            .map(|((sn, _), sk)| partial_sign(sk, sn, &ctx, &agg_nonce, &message).unwrap())
            .collect();

        for (i, partial) in partials.iter().enumerate() {
            assert!(verify_partial_signature(
                &ctx,
                partial,
                &agg_nonce,
                &signers[i],
                &pubnonces[i],
                &message,
            ));
        }

        let final_sig = aggregate_signatures(&ctx, &agg_nonce, &partials, &message).unwrap();
        assert!(verify_aggregated_signature(&agg_xonly, &final_sig, &message));
    }

    #[test]
    fn taproot_tweak_changes_aggregate_key() {
        let (_a_sk, a_pk) = keypair(1);
        let (_b_sk, b_pk) = keypair(2);
        let (_untweaked_ctx, untweaked) = key_agg(&[a_pk, b_pk]).unwrap();
        let (_tweaked_ctx, tweaked) = key_agg_tweaked(&[a_pk, b_pk]).unwrap();
        assert_ne!(untweaked, tweaked);
    }

    #[test]
    fn mismatched_messages_fail_aggregation() {
        let (a_sk, a_pk) = keypair(1);
        let (b_sk, b_pk) = keypair(2);
        let ctx = key_agg(&[a_pk, b_pk]).unwrap().0;
        let message = [0xABu8; 32];
        let other_message = [0xFFu8; 32];

        let (a_sn, a_pn) = generate_nonce(&a_sk, &ctx, &message).unwrap();
        let (b_sn, b_pn) = generate_nonce(&b_sk, &ctx, &message).unwrap();
        let agg_nonce = aggregate_nonces(&[a_pn, b_pn]);

        let a_partial = partial_sign(&a_sk, a_sn, &ctx, &agg_nonce, &message).unwrap();
        let b_partial = partial_sign(&b_sk, b_sn, &ctx, &agg_nonce, &other_message).unwrap();

        assert!(aggregate_signatures(&ctx, &agg_nonce, &[a_partial, b_partial], &message).is_err());
    }

    #[test]
    fn pubnonce_and_partial_sig_serialization_roundtrip() {
        let (a_sk, a_pk) = keypair(1);
        let (_b_sk, b_pk) = keypair(2);
        let ctx = key_agg(&[a_pk, b_pk]).unwrap().0;
        let message = [0x11u8; 32];

        let (secnonce, pubnonce) = generate_nonce(&a_sk, &ctx, &message).unwrap();
        let nonce_bytes = pubnonce_to_bytes(&pubnonce);
        assert_eq!(pubnonce_from_bytes(&nonce_bytes).unwrap().serialize(), pubnonce.serialize());

        let agg_nonce = aggregate_nonces(&[pubnonce]);
        let partial = partial_sign(&a_sk, secnonce, &ctx, &agg_nonce, &message).unwrap();
        let sig_bytes = partial_sig_to_bytes(&partial);
        assert_eq!(
            partial_sig_from_bytes(&sig_bytes).unwrap().serialize(),
            partial.serialize()
        );
    }
}
