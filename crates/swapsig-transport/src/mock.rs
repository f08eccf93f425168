//! In-process reference adapters: a shared [`MockNetwork`] hub that lets several
//! [`MockTransport`] handles exchange direct messages, broadcasts, and pub-sub
//! topics without any real sockets, plus a [`MockChainAdapter`] whose
//! confirmations are driven by the test itself.

use crate::{
    BroadcastOptions, ChainAdapter, ChainError, ConfirmationResult, Stream, Transport,
    TransportError, TransportEvent,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swapsig_core::digest_parts;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct NetworkState {
    peers: HashMap<String, broadcast::Sender<TransportEvent>>,
    topic_subs: HashMap<String, HashSet<String>>,
    dht: HashMap<Vec<u8>, Vec<u8>>,
}

/// Shared hub for an in-process test network. Clone freely; clones share state.
#[derive(Clone)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                peers: HashMap::new(),
                topic_subs: HashMap::new(),
                dht: HashMap::new(),
            })),
        }
    }

    /// Register a new peer on this network and return its [`MockTransport`] handle.
    pub fn join(&self, peer_id: impl Into<String>) -> MockTransport {
        let peer_id = peer_id.into();
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.state
            .lock()
            .unwrap()
            .peers
            .insert(peer_id.clone(), tx.clone());
        MockTransport {
            peer_id,
            network: self.clone(),
            events_tx: tx,
        }
    }
}

/// An in-process [`Transport`] implementation backed by a [`MockNetwork`].
pub struct MockTransport {
    peer_id: String,
    network: MockNetwork,
    events_tx: broadcast::Sender<TransportEvent>,
}

struct MockStream {
    network: MockNetwork,
    from_peer_id: String,
    to_peer_id: String,
    protocol_id: String,
    closed: bool,
}

#[async_trait]
impl Stream for MockStream {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }
        self.network
            .deliver_to(&self.to_peer_id, &self.protocol_id, bytes, &self.from_peer_id)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

impl MockNetwork {
    fn deliver_to(
        &self,
        peer_id: &str,
        protocol_id: &str,
        bytes: &[u8],
        from_peer_id: &str,
    ) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap();
        let sender = state
            .peers
            .get(peer_id)
            .ok_or_else(|| TransportError::NoRoute(peer_id.to_string()))?;
        let _ = sender.send(TransportEvent::Message {
            protocol_id: protocol_id.to_string(),
            payload: bytes.to_vec(),
            from_peer_id: from_peer_id.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn dial(&self, peer_addr: &str) -> Result<(), TransportError> {
        let exists = self
            .network
            .state
            .lock()
            .unwrap()
            .peers
            .contains_key(peer_addr);
        if !exists {
            return Err(TransportError::NoRoute(peer_addr.to_string()));
        }
        let _ = self
            .events_tx
            .send(TransportEvent::PeerConnected(peer_addr.to_string()));
        Ok(())
    }

    async fn disconnect(&self, peer_id: &str) -> Result<(), TransportError> {
        let _ = self
            .events_tx
            .send(TransportEvent::PeerDisconnected(peer_id.to_string()));
        Ok(())
    }

    async fn open_stream(
        &self,
        peer_id: &str,
        protocol_id: &str,
    ) -> Result<Box<dyn Stream>, TransportError> {
        let exists = self
            .network
            .state
            .lock()
            .unwrap()
            .peers
            .contains_key(peer_id);
        if !exists {
            return Err(TransportError::NoRoute(peer_id.to_string()));
        }
        Ok(Box::new(MockStream {
            network: self.network.clone(),
            from_peer_id: self.peer_id.clone(),
            to_peer_id: peer_id.to_string(),
            protocol_id: protocol_id.to_string(),
            closed: false,
        }))
    }

    async fn broadcast(
        &self,
        protocol_id: &str,
        bytes: &[u8],
        options: BroadcastOptions,
    ) -> Result<(), TransportError> {
        let targets: Vec<String> = {
            let state = self.network.state.lock().unwrap();
            match &options.only_to {
                Some(only) => only.clone(),
                None => state.peers.keys().cloned().collect(),
            }
        };
        for target in targets {
            if options.exclude.iter().any(|e| e == &target) {
                continue;
            }
            // emitSelf: the sender processes its own broadcast through the same
            // Message-event path as every other receiver.
            self.network
                .deliver_to(&target, protocol_id, bytes, &self.peer_id)?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.network
            .state
            .lock()
            .unwrap()
            .topic_subs
            .entry(topic.to_string())
            .or_default()
            .insert(self.peer_id.clone());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if let Some(subs) = self
            .network
            .state
            .lock()
            .unwrap()
            .topic_subs
            .get_mut(topic)
        {
            subs.remove(&self.peer_id);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let subs: Vec<String> = {
            let state = self.network.state.lock().unwrap();
            state
                .topic_subs
                .get(topic)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect()
        };
        for peer in subs {
            self.network.deliver_to(&peer, topic, bytes, &self.peer_id)?;
        }
        Ok(())
    }

    async fn dht_put(
        &self,
        key: &[u8],
        value: &[u8],
        _deadline: Duration,
    ) -> Result<(), TransportError> {
        self.network
            .state
            .lock()
            .unwrap()
            .dht
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn dht_get(
        &self,
        key: &[u8],
        _deadline: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.network.state.lock().unwrap().dht.get(key).cloned())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

/// A [`ChainAdapter`] whose confirmation counts are advanced explicitly by the
/// test calling [`MockChainAdapter::confirm`], rather than by any real chain.
#[derive(Clone, Default)]
pub struct MockChainAdapter {
    confirmations: Arc<Mutex<HashMap<String, u32>>>,
}

impl MockChainAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate `n` additional confirmations landing for `tx_id`.
    pub fn confirm(&self, tx_id: &str, n: u32) {
        *self
            .confirmations
            .lock()
            .unwrap()
            .entry(tx_id.to_string())
            .or_insert(0) += n;
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String, ChainError> {
        let tx_id = digest_parts(&[raw_hex.as_bytes()]).to_hex();
        self.confirmations.lock().unwrap().entry(tx_id.clone()).or_insert(0);
        Ok(tx_id)
    }

    async fn wait_for_confirmations(
        &self,
        tx_id: &str,
        n: u32,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<ConfirmationResult, ChainError> {
        let start = tokio::time::Instant::now();
        loop {
            let confirmations = *self
                .confirmations
                .lock()
                .unwrap()
                .get(tx_id)
                .unwrap_or(&0);
            if confirmations >= n {
                return Ok(ConfirmationResult {
                    is_confirmed: true,
                    confirmations,
                    block_height: None,
                });
            }
            if start.elapsed() >= deadline {
                return Err(ChainError::ConfirmationTimeout);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
