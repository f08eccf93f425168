//! Resource Directory: a typed DHT key scheme plus a local cache with TTL-based
//! eviction, sitting in front of the transport adapter's DHT. Higher layers
//! publish and fetch opaque, already-signed byte blobs keyed by resource type;
//! verifying the signature inside those bytes is the caller's job, not the
//! directory's — the directory only owns cache lifecycle and key shape.

use bitcoin::secp256k1::PublicKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swapsig_core::Digest32;
use swapsig_transport::{Transport, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The four directory key shapes named by the external interface: signer
/// advertisements, signing requests, pool announcements, and session
/// descriptors, each namespaced so the same digest space can't collide across
/// resource types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DirectoryKey {
    Signer(PublicKey),
    SigningRequest(Digest32),
    Pool(Digest32),
    Session(Digest32),
}

impl DirectoryKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DirectoryKey::Signer(pk) => {
                let mut b = vec![0u8];
                b.extend_from_slice(&pk.serialize());
                b
            }
            DirectoryKey::SigningRequest(id) => {
                let mut b = vec![1u8];
                b.extend_from_slice(id.as_bytes());
                b
            }
            DirectoryKey::Pool(id) => {
                let mut b = vec![2u8];
                b.extend_from_slice(id.as_bytes());
                b
            }
            DirectoryKey::Session(id) => {
                let mut b = vec![3u8];
                b.extend_from_slice(id.as_bytes());
                b
            }
        }
    }
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Local cache of directory entries, backed by a transport's DHT for entries
/// this node hasn't seen directly.
pub struct Directory {
    transport: Arc<dyn Transport>,
    cache: Mutex<HashMap<Vec<u8>, CacheEntry>>,
    dht_deadline: Duration,
}

impl Directory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: Mutex::new(HashMap::new()),
            dht_deadline: Duration::from_secs(5),
        }
    }

    pub fn with_dht_deadline(mut self, deadline: Duration) -> Self {
        self.dht_deadline = deadline;
        self
    }

    /// Publish a resource: store it in the local cache with `ttl` and put it on
    /// the DHT under its directory key.
    pub async fn publish(
        &self,
        key: &DirectoryKey,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), DirectoryError> {
        let key_bytes = key.to_bytes();
        self.cache.lock().unwrap().insert(
            key_bytes.clone(),
            CacheEntry {
                value: value.clone(),
                expires_at: now_secs() + ttl.as_secs(),
            },
        );
        self.transport
            .dht_put(&key_bytes, &value, self.dht_deadline)
            .await?;
        Ok(())
    }

    /// Fetch a resource: return a live local-cache hit, otherwise query the DHT
    /// and cache what comes back under a short default TTL.
    pub async fn fetch(&self, key: &DirectoryKey) -> Result<Option<Vec<u8>>, DirectoryError> {
        self.purge_expired();
        let key_bytes = key.to_bytes();
        if let Some(entry) = self.cache.lock().unwrap().get(&key_bytes) {
            return Ok(Some(entry.value.clone()));
        }
        let fetched = self
            .transport
            .dht_get(&key_bytes, self.dht_deadline)
            .await?;
        if let Some(value) = &fetched {
            self.cache.lock().unwrap().insert(
                key_bytes,
                CacheEntry {
                    value: value.clone(),
                    expires_at: now_secs() + 60,
                },
            );
        }
        Ok(fetched)
    }

    /// Return every locally cached, still-live value. Used by discovery to scan
    /// before falling back to a DHT query.
    pub fn scan_cache(&self) -> Vec<Vec<u8>> {
        self.purge_expired();
        self.cache
            .lock()
            .unwrap()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Explicit withdrawal: evict a resource from the local cache immediately,
    /// independent of its TTL.
    pub fn withdraw(&self, key: &DirectoryKey) {
        self.cache.lock().unwrap().remove(&key.to_bytes());
    }

    fn purge_expired(&self) {
        let now = now_secs();
        self.cache.lock().unwrap().retain(|_, e| e.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapsig_transport::mock::MockNetwork;

    fn signer_key() -> DirectoryKey {
        let kp = swapsig_core::LongTermKeypair::generate();
        DirectoryKey::Signer(kp.public_key())
    }

    #[tokio::test]
    async fn publish_then_fetch_hits_local_cache() {
        let net = MockNetwork::new();
        let transport = Arc::new(net.join("alice"));
        let dir = Directory::new(transport);
        let key = signer_key();

        dir.publish(&key, b"advertisement-bytes".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let got = dir.fetch(&key).await.unwrap();
        assert_eq!(got, Some(b"advertisement-bytes".to_vec()));
    }

    #[tokio::test]
    async fn fetch_falls_back_to_dht_across_nodes() {
        let net = MockNetwork::new();
        let alice_transport = Arc::new(net.join("alice"));
        let bob_transport = Arc::new(net.join("bob"));
        let alice_dir = Directory::new(alice_transport);
        let bob_dir = Directory::new(bob_transport);
        let key = signer_key();

        alice_dir
            .publish(&key, b"from-alice".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        // bob has nothing cached locally, but the DHT put is global to the network.
        let got = bob_dir.fetch(&key).await.unwrap();
        assert_eq!(got, Some(b"from-alice".to_vec()));
    }

    #[tokio::test]
    async fn withdraw_removes_from_cache() {
        let net = MockNetwork::new();
        let transport = Arc::new(net.join("alice"));
        let dir = Directory::new(transport);
        let key = signer_key();

        dir.publish(&key, b"stuff".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        dir.withdraw(&key);

        // withdrawn from the local cache; the DHT copy is untouched so a remote
        // fetch would still see it, but scan_cache (local only) must not.
        assert!(dir.scan_cache().is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_purged_from_scan() {
        let net = MockNetwork::new();
        let transport = Arc::new(net.join("alice"));
        let dir = Directory::new(transport);
        let key = signer_key();

        dir.publish(&key, b"stuff".to_vec(), Duration::from_secs(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(dir.scan_cache().is_empty());
    }

    #[test]
    fn directory_keys_are_namespaced() {
        let kp = swapsig_core::LongTermKeypair::generate();
        let id = swapsig_core::digest_parts(&[b"x"]);
        let signer_key = DirectoryKey::Signer(kp.public_key()).to_bytes();
        let pool_key = DirectoryKey::Pool(id).to_bytes();
        let session_key = DirectoryKey::Session(id).to_bytes();
        assert_ne!(signer_key[0], pool_key[0]);
        assert_ne!(pool_key[0], session_key[0]);
    }
}
