//! Long-term signer identity: a secp256k1 keypair used both to sign
//! advertisements/requests/proofs and as a MuSig2 signer key.
//!
//! Persistence format: a version byte followed by the 32-byte secret key,
//! written to a user-chosen file. This is `swapsig`'s canonical bytes format —
//! not protobuf, since nothing else in this stack pulls in a protobuf
//! dependency (see DESIGN.md for the Open-Question resolution).

use bitcoin::secp256k1::{rand, schnorr, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

const PERSIST_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt identity file: {0}")]
    Corrupt(String),
    #[error("unsupported identity file version: {0}")]
    UnsupportedVersion(u8),
    #[error("signature verification failed")]
    InvalidSignature,
}

/// A stable self-certifying identifier derived from a signer's long-term public key.
///
/// Created on first start from either a random key or a provided key blob;
/// persisted out-of-band; destroyed only when the node is reprovisioned.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn from_pubkey(pk: &PublicKey) -> Self {
        Self(hex::encode(pk.serialize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({})", self.0)
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A secret scalar and its curve point. The secret never leaves the process;
/// `public_key` is the only identifier of a signer at the application layer.
pub struct LongTermKeypair {
    secret: Zeroizing<SecretKey>,
    public_key: PublicKey,
}

impl LongTermKeypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            secret: Zeroizing::new(secret),
            public_key,
        }
    }

    /// Build a keypair from an already-derived secret scalar.
    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = secret.public_key(&secp);
        Self {
            secret: Zeroizing::new(secret),
            public_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity::from_pubkey(&self.public_key)
    }

    /// Sign a 32-byte message digest with BIP-340 Schnorr, under our x-only key.
    pub fn sign_schnorr(&self, message: &[u8; 32]) -> schnorr::Signature {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &self.secret);
        let msg = Message::from_digest(*message);
        secp.sign_schnorr(&msg, &keypair)
    }

    /// Expose the secret key for MuSig2 nonce generation and partial signing
    /// (`swapsig-musig2` needs the raw scalar). Callers must not persist or log it.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Load an identity from a persisted canonical-bytes file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let bytes = fs::read(path)?;
        if bytes.len() != 33 {
            return Err(IdentityError::Corrupt(format!(
                "expected 33 bytes, got {}",
                bytes.len()
            )));
        }
        let version = bytes[0];
        if version != PERSIST_VERSION {
            return Err(IdentityError::UnsupportedVersion(version));
        }
        let secret = SecretKey::from_slice(&bytes[1..33])
            .map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    /// Load the identity at `path`, generating and persisting a new one if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            let keypair = Self::generate();
            keypair.persist(path)?;
            Ok(keypair)
        }
    }

    /// Persist this identity's secret key to `path` in the canonical bytes format.
    pub fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = Zeroizing::new(Vec::with_capacity(33));
        out.push(PERSIST_VERSION);
        out.extend_from_slice(&self.secret.secret_bytes());

        let mut file = fs::File::create(path)?;
        file.write_all(&out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

/// Verify a BIP-340 Schnorr signature under `pubkey` over a 32-byte digest.
pub fn verify_schnorr(
    pubkey: &PublicKey,
    message: &[u8; 32],
    signature: &schnorr::Signature,
) -> Result<(), IdentityError> {
    let secp = Secp256k1::verification_only();
    let (xonly, _parity) = pubkey.x_only_public_key();
    let msg = Message::from_digest(*message);
    secp.verify_schnorr(signature, &msg, &xonly)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = LongTermKeypair::generate();
        let msg = [0x42u8; 32];
        let sig = kp.sign_schnorr(&msg);
        assert!(verify_schnorr(&kp.public_key(), &msg, &sig).is_ok());
    }

    #[test]
    fn wrong_message_rejected() {
        let kp = LongTermKeypair::generate();
        let sig = kp.sign_schnorr(&[0x01u8; 32]);
        assert!(verify_schnorr(&kp.public_key(), &[0x02u8; 32], &sig).is_err());
    }

    #[test]
    fn persist_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.bin");

        let kp = LongTermKeypair::generate();
        kp.persist(&path).unwrap();

        let loaded = LongTermKeypair::load(&path).unwrap();
        assert_eq!(loaded.public_key(), kp.public_key());
    }

    #[test]
    fn load_or_generate_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.bin");

        let first = LongTermKeypair::load_or_generate(&path).unwrap();
        let second = LongTermKeypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn corrupt_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.bin");
        fs::write(&path, b"too short").unwrap();
        assert!(matches!(
            LongTermKeypair::load(&path),
            Err(IdentityError::Corrupt(_))
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.bin");
        let mut bytes = vec![99u8];
        bytes.extend_from_slice(&[0x01u8; 32]);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            LongTermKeypair::load(&path),
            Err(IdentityError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn peer_identity_is_stable() {
        let kp = LongTermKeypair::generate();
        assert_eq!(kp.peer_identity(), kp.peer_identity());
    }
}
