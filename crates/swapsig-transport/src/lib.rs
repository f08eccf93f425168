//! Transport and chain adapter traits consumed (not implemented) by the
//! coordination core, plus an in-process reference adapter (`mock`) used by
//! integration tests and any embedder that doesn't need a real P2P stack.
//!
//! The DHT/pub-sub transport itself and chain-confirmation query are out of
//! scope for this workspace; only the interfaces they must expose are named here.

pub mod mock;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no route to peer {0}")]
    NoRoute(String),
    #[error("stream closed")]
    StreamClosed,
    #[error("dht deadline exceeded")]
    DhtTimeout,
    #[error("unknown topic {0}")]
    UnknownTopic(String),
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
    #[error("confirmation wait exceeded its deadline")]
    ConfirmationTimeout,
}

/// Events a transport adapter surfaces to the coordination core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(String),
    PeerDisconnected(String),
    PeerDiscovered(String),
    RelayAddressesAvailable(Vec<String>),
    Message {
        protocol_id: String,
        payload: Vec<u8>,
        from_peer_id: String,
    },
}

/// A single open duplex stream to one peer under one protocol id.
#[async_trait]
pub trait Stream: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Options narrowing a [`Transport::broadcast`] call.
#[derive(Default, Clone, Debug)]
pub struct BroadcastOptions {
    pub exclude: Vec<String>,
    pub only_to: Option<Vec<String>>,
}

/// Everything the coordination core needs from the underlying peer-to-peer
/// stack: direct streams, protocol broadcast, pub-sub topics, and a DHT.
/// Implemented externally; this workspace only defines and mocks the contract.
#[async_trait]
pub trait Transport: Send + Sync {
    fn peer_id(&self) -> &str;

    async fn dial(&self, peer_addr: &str) -> Result<(), TransportError>;
    async fn disconnect(&self, peer_id: &str) -> Result<(), TransportError>;

    async fn open_stream(
        &self,
        peer_id: &str,
        protocol_id: &str,
    ) -> Result<Box<dyn Stream>, TransportError>;

    async fn broadcast(
        &self,
        protocol_id: &str,
        bytes: &[u8],
        options: BroadcastOptions,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn publish(&self, topic: &str, bytes: &[u8]) -> Result<(), TransportError>;

    async fn dht_put(
        &self,
        key: &[u8],
        value: &[u8],
        deadline: Duration,
    ) -> Result<(), TransportError>;
    async fn dht_get(
        &self,
        key: &[u8],
        deadline: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// A fresh receiver over this adapter's event stream. Each call to
    /// `subscribe_events` gets an independent receiver; events broadcast before
    /// a given receiver was created are not replayed to it.
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent>;
}

/// Result of polling the chain for confirmations of a broadcast transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationResult {
    pub is_confirmed: bool,
    pub confirmations: u32,
    pub block_height: Option<u64>,
}

/// Everything the settlement/setup rounds need from chain access: broadcasting a
/// raw transaction and polling for confirmations. Implemented externally.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String, ChainError>;

    async fn wait_for_confirmations(
        &self,
        tx_id: &str,
        n: u32,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<ConfirmationResult, ChainError>;
}
