//! Shared protocol data model: [`Advertisement`], [`SigningRequest`], and
//! [`BurnConfig`]. These are value types cached and passed between every layer, so
//! they live in `swapsig-core` rather than in any one layer crate.

use crate::digest::{digest_parts, Digest32};
use crate::identity::{verify_schnorr, IdentityError, LongTermKeypair};
use crate::wire::{encode_point, write_bytes};
use bitcoin::secp256k1::{schnorr, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("advertisement expired at {expires_at}, now is {now}")]
    AdvertisementExpired { expires_at: u64, now: u64 },
    #[error("expiresAt ({expires_at}) must be greater than issuedAt ({issued_at})")]
    BadExpiry { issued_at: u64, expires_at: u64 },
    #[error("creatorPubKey is not a member of requiredPubKeys")]
    CreatorNotRequired,
    #[error("requiredPubKeys must be unique")]
    DuplicateRequiredKey,
}

/// Capability claim carried by an [`Advertisement`]: which transaction types a
/// signer accepts and the amount range it's willing to co-sign for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub tx_types: Vec<String>,
    pub min_amount: u64,
    pub max_amount: u64,
}

impl Capability {
    fn canonical_bytes(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.tx_types.len() as u32).to_le_bytes());
        for t in &self.tx_types {
            write_bytes(buf, t.as_bytes());
        }
        buf.extend_from_slice(&self.min_amount.to_le_bytes());
        buf.extend_from_slice(&self.max_amount.to_le_bytes());
    }

    pub fn accepts(&self, tx_type: &str, amount: u64) -> bool {
        self.tx_types.iter().any(|t| t == tx_type)
            && amount >= self.min_amount
            && amount <= self.max_amount
    }
}

/// A signed capability claim published to the resource directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Advertisement {
    pub peer: String,
    pub signer_pub_key: PublicKey,
    pub capability: Capability,
    pub metadata: Option<String>,
    pub issued_at: u64,
    pub expires_at: u64,
    #[serde(with = "schnorr_sig_serde")]
    pub signature: schnorr::Signature,
}

impl Advertisement {
    /// Build and sign a fresh advertisement. Fails only if `expires_at <= issued_at`.
    pub fn new(
        keypair: &LongTermKeypair,
        peer: String,
        capability: Capability,
        metadata: Option<String>,
        issued_at: u64,
        expires_at: u64,
    ) -> Result<Self, ModelError> {
        if expires_at <= issued_at {
            return Err(ModelError::BadExpiry {
                issued_at,
                expires_at,
            });
        }
        let signer_pub_key = keypair.public_key();
        let digest = Self::signing_digest(
            &peer,
            &signer_pub_key,
            &capability,
            &metadata,
            issued_at,
            expires_at,
        );
        let signature = keypair.sign_schnorr(&digest);
        Ok(Self {
            peer,
            signer_pub_key,
            capability,
            metadata,
            issued_at,
            expires_at,
            signature,
        })
    }

    fn signing_digest(
        peer: &str,
        signer_pub_key: &PublicKey,
        capability: &Capability,
        metadata: &Option<String>,
        issued_at: u64,
        expires_at: u64,
    ) -> [u8; 32] {
        let mut buf = Vec::new();
        write_bytes(&mut buf, peer.as_bytes());
        buf.extend_from_slice(&encode_point(signer_pub_key));
        capability.canonical_bytes(&mut buf);
        match metadata {
            Some(m) => {
                buf.push(1);
                write_bytes(&mut buf, m.as_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&issued_at.to_le_bytes());
        buf.extend_from_slice(&expires_at.to_le_bytes());
        digest_parts(&[&buf]).0
    }

    /// Verify the signature and that `now < expires_at`.
    pub fn verify(&self, now: u64) -> Result<(), ModelError> {
        if now >= self.expires_at {
            return Err(ModelError::AdvertisementExpired {
                expires_at: self.expires_at,
                now,
            });
        }
        let digest = Self::signing_digest(
            &self.peer,
            &self.signer_pub_key,
            &self.capability,
            &self.metadata,
            self.issued_at,
            self.expires_at,
        );
        verify_schnorr(&self.signer_pub_key, &digest, &self.signature)?;
        Ok(())
    }

    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// A request for an n-of-n MuSig2 signature over `message`, announced to the
/// directory so every required co-signer can discover and auto-join.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningRequest {
    pub request_id: Digest32,
    pub creator_pub_key: PublicKey,
    pub required_pub_keys: Vec<PublicKey>,
    pub message: [u8; 32],
    pub metadata: Option<String>,
    pub issued_at: u64,
    #[serde(with = "schnorr_sig_serde")]
    pub creator_signature: schnorr::Signature,
}

impl SigningRequest {
    /// Build, validate, and sign a new signing request. `request_id` is a
    /// content-addressed digest over every other field.
    pub fn new(
        keypair: &LongTermKeypair,
        required_pub_keys: Vec<PublicKey>,
        message: [u8; 32],
        metadata: Option<String>,
        issued_at: u64,
    ) -> Result<Self, ModelError> {
        let creator_pub_key = keypair.public_key();
        if !required_pub_keys.contains(&creator_pub_key) {
            return Err(ModelError::CreatorNotRequired);
        }
        let mut dedup = required_pub_keys.clone();
        dedup.sort_by_key(|k| k.serialize());
        dedup.dedup();
        if dedup.len() != required_pub_keys.len() {
            return Err(ModelError::DuplicateRequiredKey);
        }

        let fields_digest = Self::fields_digest(
            &creator_pub_key,
            &required_pub_keys,
            &message,
            &metadata,
            issued_at,
        );
        let request_id = fields_digest;
        let creator_signature = keypair.sign_schnorr(&fields_digest.0);
        Ok(Self {
            request_id,
            creator_pub_key,
            required_pub_keys,
            message,
            metadata,
            issued_at,
            creator_signature,
        })
    }

    fn fields_digest(
        creator_pub_key: &PublicKey,
        required_pub_keys: &[PublicKey],
        message: &[u8; 32],
        metadata: &Option<String>,
        issued_at: u64,
    ) -> Digest32 {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_point(creator_pub_key));
        buf.extend_from_slice(&(required_pub_keys.len() as u32).to_le_bytes());
        for pk in required_pub_keys {
            buf.extend_from_slice(&encode_point(pk));
        }
        write_bytes(&mut buf, message);
        match metadata {
            Some(m) => {
                buf.push(1);
                write_bytes(&mut buf, m.as_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&issued_at.to_le_bytes());
        digest_parts(&[&buf])
    }

    /// Verify `creatorSignature` and recompute `requestId`, rejecting a request
    /// whose declared id doesn't match its own fields.
    pub fn verify(&self) -> Result<(), ModelError> {
        let fields_digest = Self::fields_digest(
            &self.creator_pub_key,
            &self.required_pub_keys,
            &self.message,
            &self.metadata,
            self.issued_at,
        );
        if fields_digest != self.request_id {
            return Err(ModelError::CreatorNotRequired);
        }
        verify_schnorr(&self.creator_pub_key, &fields_digest.0, &self.creator_signature)?;
        Ok(())
    }
}

/// Sybil-resistance burn parameters for a swap pool.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BurnConfig {
    pub burn_percentage: f64,
    pub minimum_burn: u64,
    pub maximum_burn: u64,
    pub burn_identifier: [u8; 4],
    pub pool_id_in_burn: bool,
    pub version: u8,
}

impl BurnConfig {
    /// `burnAmount = clamp(floor(denomination * burnPercentage), minimumBurn, maximumBurn)`.
    pub fn burn_amount(&self, denomination: u64) -> u64 {
        let raw = (denomination as f64 * self.burn_percentage).floor() as u64;
        raw.clamp(self.minimum_burn, self.maximum_burn)
    }
}

mod schnorr_sig_serde {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn cap() -> Capability {
        Capability {
            tx_types: vec!["SPEND".to_string()],
            min_amount: 1_000_000,
            max_amount: 100_000_000,
        }
    }

    #[test]
    fn advertisement_roundtrip_verifies() {
        let kp = LongTermKeypair::generate();
        let ad = Advertisement::new(
            &kp,
            "peer-a".to_string(),
            cap(),
            None,
            100,
            200,
        )
        .unwrap();
        assert!(ad.verify(150).is_ok());
    }

    #[test]
    fn advertisement_expired_rejected() {
        let kp = LongTermKeypair::generate();
        let ad = Advertisement::new(&kp, "peer-a".to_string(), cap(), None, 100, 200).unwrap();
        assert!(matches!(
            ad.verify(200),
            Err(ModelError::AdvertisementExpired { .. })
        ));
    }

    #[test]
    fn advertisement_bad_expiry_rejected() {
        let kp = LongTermKeypair::generate();
        assert!(matches!(
            Advertisement::new(&kp, "peer-a".to_string(), cap(), None, 200, 100),
            Err(ModelError::BadExpiry { .. })
        ));
    }

    #[test]
    fn advertisement_tamper_detected() {
        let kp = LongTermKeypair::generate();
        let mut ad = Advertisement::new(&kp, "peer-a".to_string(), cap(), None, 100, 200).unwrap();
        ad.capability.max_amount += 1;
        assert!(ad.verify(150).is_err());
    }

    #[test]
    fn capability_accepts_within_range() {
        let c = cap();
        assert!(c.accepts("SPEND", 5_000_000));
        assert!(!c.accepts("SPEND", 1));
        assert!(!c.accepts("OTHER", 5_000_000));
    }

    #[test]
    fn signing_request_requires_creator_in_set() {
        let creator = LongTermKeypair::generate();
        let other = LongTermKeypair::generate();
        let result = SigningRequest::new(
            &creator,
            vec![other.public_key()],
            [7u8; 32],
            None,
            100,
        );
        assert!(matches!(result, Err(ModelError::CreatorNotRequired)));
    }

    #[test]
    fn signing_request_rejects_duplicate_keys() {
        let creator = LongTermKeypair::generate();
        let result = SigningRequest::new(
            &creator,
            vec![creator.public_key(), creator.public_key()],
            [7u8; 32],
            None,
            100,
        );
        assert!(matches!(result, Err(ModelError::DuplicateRequiredKey)));
    }

    #[test]
    fn signing_request_verifies() {
        let creator = LongTermKeypair::generate();
        let other = LongTermKeypair::generate();
        let req = SigningRequest::new(
            &creator,
            vec![creator.public_key(), other.public_key()],
            [7u8; 32],
            None,
            100,
        )
        .unwrap();
        assert!(req.verify().is_ok());
    }

    #[test]
    fn burn_amount_clamps() {
        let cfg = BurnConfig {
            burn_percentage: 0.001,
            minimum_burn: 500,
            maximum_burn: 10_000,
            burn_identifier: *b"BURN",
            pool_id_in_burn: true,
            version: 1,
        };
        assert_eq!(cfg.burn_amount(1_000_000), 1_000);
        assert_eq!(cfg.burn_amount(100), 500);
        assert_eq!(cfg.burn_amount(1_000_000_000), 10_000);
    }
}
