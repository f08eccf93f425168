//! Wires the coordination layers together and runs the node's event loop.
//!
//! The transport and chain adapter are out of scope for this workspace (see
//! spec §1 Non-goals), so the daemon wires `swapsig-transport::mock`'s
//! in-process reference adapter. An embedder swaps in a real libp2p/Nostr
//! transport and Electrum/esplora chain adapter behind the same traits.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use swapsig_core::{digest_parts, Digest32, LongTermKeypair, WireMessage};
use swapsig_directory::Directory;
use swapsig_discovery::{DiscoveryCoordinator, DiscoveryEvent};
use swapsig_pool::PoolOrchestrator;
use swapsig_security::{Admission, SecurityGate};
use swapsig_transport::mock::{MockChainAdapter, MockNetwork};
use swapsig_transport::{ChainAdapter, Transport, TransportEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

const MUSIG2_PROTOCOL: &str = "swapsig-musig2";
const DISCOVERY_PROTOCOL: &str = "swapsig-discovery";
const POOL_TOPIC_PREFIX: &str = "swapsig-pool:";

/// Everything one process needs to participate as a swapsig node.
pub struct Node {
    pub discovery: Arc<DiscoveryCoordinator>,
    pub pool: Arc<PoolOrchestrator>,
    security: Mutex<SecurityGate>,
    transport: Arc<dyn Transport>,
    /// Keeps the in-process reference network alive for the process lifetime.
    _network: MockNetwork,
}

impl Node {
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.node.data_dir)
            .with_context(|| format!("failed to create data dir: {}", config.node.data_dir.display()))?;

        let identity = LongTermKeypair::load_or_generate(&config.identity_path())
            .context("failed to load or generate the long-term identity key")?;
        log::info!("peer identity: {}", identity.peer_identity().as_str());

        let secret = *identity.secret_key();
        let peer_id = identity.peer_identity().as_str().to_string();

        let network = MockNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.join(peer_id.clone()));
        let chain: Arc<dyn ChainAdapter> = Arc::new(MockChainAdapter::new());
        let directory = Arc::new(Directory::new(transport.clone()));

        let discovery = Arc::new(DiscoveryCoordinator::new(
            identity,
            transport.clone(),
            directory.clone(),
        ));
        discovery.start().await.context("failed to subscribe to the signer topic")?;

        let pool = Arc::new(PoolOrchestrator::new(
            LongTermKeypair::from_secret(secret),
            transport.clone(),
            directory,
            discovery.clone(),
            chain,
            config.network(),
        ));

        let security = Mutex::new(SecurityGate::new(config.security.to_gate_config()));

        Ok(Self {
            discovery,
            pool,
            security,
            transport,
            _network: network,
        })
    }

    /// Drain transport events forever, routing each to the discovery
    /// coordinator or the pool orchestrator. Returns once the transport's
    /// event channel closes.
    pub async fn run_event_loop(&self) -> Result<()> {
        let mut events = self.transport.subscribe_events();
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle_transport_event(event).await {
                        log::warn!("dropping inbound message: {e:#}");
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("event subscriber lagged, dropped {n} events");
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) -> Result<()> {
        let TransportEvent::Message { protocol_id, payload, from_peer_id } = event else {
            return Ok(());
        };

        let admission = {
            let mut gate = self.security.lock().await;
            gate.admit(&from_peer_id, payload.len(), digest_parts(&[payload.as_slice()]), Instant::now())
        };
        match admission {
            Ok(Admission::Accept) => {}
            Ok(Admission::Duplicate) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if protocol_id == MUSIG2_PROTOCOL {
            let events = self.discovery.handle_musig2_message(&payload).await?;
            self.dispatch_discovery_events(events).await?;
            return Ok(());
        }

        if protocol_id.starts_with(POOL_TOPIC_PREFIX) {
            let pool_id = Digest32::from_hex(protocol_id.trim_start_matches(POOL_TOPIC_PREFIX))
                .ok_or_else(|| anyhow::anyhow!("malformed pool topic {protocol_id}"))?;
            self.pool.handle_participant_registered(pool_id, &payload)?;
            return Ok(());
        }

        // Everything else travels wrapped in a `WireMessage` envelope; the
        // only other inbound type this node currently reacts to is a
        // discovery-layer signing-request announcement.
        if let Ok(envelope) = WireMessage::decode(&payload) {
            if envelope.protocol == DISCOVERY_PROTOCOL && envelope.msg_type == "SIGNING_REQUEST_ANNOUNCE" {
                let events = self
                    .discovery
                    .handle_signing_request_announcement(&envelope.payload)
                    .await?;
                self.dispatch_discovery_events(events).await?;
            }
        }
        Ok(())
    }

    async fn dispatch_discovery_events(&self, events: Vec<DiscoveryEvent>) -> Result<()> {
        for event in &events {
            match event {
                DiscoveryEvent::SessionReady(session_id) => {
                    self.discovery.start_round1(*session_id).await?;
                }
                DiscoveryEvent::SessionCompleted(_) => {
                    // A completed settlement session may belong to any pool this
                    // node tracks; let each pool check whether it owns it.
                    for pool_id in self.pool.tracked_pool_ids() {
                        self.pool.on_settlement_session_completed(pool_id, event).await?;
                    }
                }
                DiscoveryEvent::SessionAborted(session_id, reason) => {
                    log::warn!("session {} aborted: {reason}", session_id.to_hex());
                }
                DiscoveryEvent::SigningRequestAnnounced(_) | DiscoveryEvent::Joined(_) => {}
            }
        }
        Ok(())
    }
}
