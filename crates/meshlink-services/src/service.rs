//! The overlay owner state.
//!
//! `OverlayService` is plain synchronous state. Only the actor calls into it,
//! one command at a time, so nothing here locks. Discovery, churn, gossip,
//! resources, rendezvous, tasks and dispatch each add an `impl` block in
//! their own module.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use meshlink_core::config::MeshlinkConfig;
use meshlink_core::message::PROTOCOL_VERSION;
use meshlink_core::{
    DisconnectReason, HostAddr, Identity, KeyId, NodeDescriptor, PeerId, PeerMessage,
    ResourcePeerInfo,
};

use crate::collaborators::{Clock, PeerLink, ResourceTransfer, RoutingTable, TaskCoordinator, Transport};
use crate::error::OverlayError;
use crate::gossip::GossipBuffers;
use crate::registry::{PeerHandle, PeerRegistry, SessionId};
use crate::rendezvous::RendezvousTable;
use crate::resources::ResourceDirectory;

/// Size of the recent inbound message ring.
pub const LAST_MESSAGES: usize = 5;

/// One entry of the recent inbound message ring.
#[derive(Debug, Clone)]
pub struct LastMessage {
    pub kind: &'static str,
    pub key_id: Option<KeyId>,
    pub received_at: Instant,
    pub address: String,
    pub port: u16,
}

pub struct OverlayService {
    pub(crate) config: MeshlinkConfig,
    pub(crate) identity: Identity,
    pub(crate) node: NodeDescriptor,
    pub(crate) registry: PeerRegistry,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) routing: Box<dyn RoutingTable>,
    pub(crate) tasks: Option<Box<dyn TaskCoordinator>>,
    pub(crate) resource_transfer: Option<Box<dyn ResourceTransfer>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) last_peers_request: Instant,
    pub(crate) last_tasks_request: Instant,
    pub(crate) last_refresh: Instant,
    pub(crate) last_messages: VecDeque<LastMessage>,
    /// Address some peer told us it sees a given key at. Tried first on dial.
    pub(crate) suggested_addrs: HashMap<KeyId, String>,
    pub(crate) gossip: GossipBuffers,
    pub(crate) directory: ResourceDirectory,
    pub(crate) rendezvous: RendezvousTable,
}

impl OverlayService {
    pub fn new(
        config: MeshlinkConfig,
        identity: Identity,
        transport: Arc<dyn Transport>,
        routing: Box<dyn RoutingTable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let node = local_descriptor(&config, &identity);
        let directory = ResourceDirectory::new(node.node_id.clone());
        let rendezvous = RendezvousTable::new(config.network.rendezvous_ttl());
        Self {
            config,
            identity,
            node,
            registry: PeerRegistry::new(),
            transport,
            routing,
            tasks: None,
            resource_transfer: None,
            clock,
            last_peers_request: now,
            last_tasks_request: now,
            last_refresh: now,
            last_messages: VecDeque::with_capacity(LAST_MESSAGES),
            suggested_addrs: HashMap::new(),
            gossip: GossipBuffers::default(),
            directory,
            rendezvous,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn key_id(&self) -> KeyId {
        self.identity.key_id()
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &MeshlinkConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn set_task_coordinator(&mut self, tasks: Box<dyn TaskCoordinator>) {
        tracing::info!("task coordinator attached");
        self.tasks = Some(tasks);
    }

    pub fn set_resource_transfer(&mut self, transfer: Box<dyn ResourceTransfer>) {
        tracing::info!("resource transfer attached");
        self.resource_transfer = Some(transfer);
    }

    pub(crate) fn hello_message(&self) -> PeerMessage {
        PeerMessage::Hello {
            port: self.config.node.listen_port,
            client_id: self.node.node_id.clone(),
            key_id: self.node.key.clone(),
            node: self.node.clone(),
            proto_version: PROTOCOL_VERSION,
        }
    }

    // ── Connection callbacks ─────────────────────────────────────────────────

    /// A transport session is up. It joins the session set and gets our hello;
    /// it becomes active once the remote hello arrives.
    pub fn connection_established(
        &mut self,
        link: Arc<dyn PeerLink>,
        remote: HostAddr,
        outbound: bool,
    ) -> SessionId {
        let now = self.now();
        tracing::debug!(remote = %remote, outbound, "connection to peer established");
        let session = self.registry.insert_session(link, remote, outbound, now);
        if let Some(handle) = self.registry.session(session) {
            handle.send(self.hello_message());
        }
        session
    }

    pub fn connection_failed(&mut self, expected: Option<PeerId>) {
        let Some(peer) = expected else {
            tracing::warn!("connection to peer failed");
            return;
        };
        let max = self.config.network.max_connection_attempts;
        if self.registry.requeue_failed(&peer, max) {
            tracing::warn!(peer = %peer, "connection to peer failed, will retry");
        } else {
            tracing::warn!(peer = %peer, "connection to peer failed, giving up");
        }
    }

    pub fn connection_closed(&mut self, session: SessionId) {
        if self.unregister(session) {
            tracing::debug!(session = %session, "session closed");
        }
    }

    // ── Registry operations ──────────────────────────────────────────────────

    /// Make `session` the active session for `peer` and advertise the new degree.
    /// A session it displaces is closed as a duplicate.
    pub fn register(&mut self, peer: PeerId, session: SessionId) -> Result<(), OverlayError> {
        if let Some(displaced) = self.registry.register(peer, session)? {
            tracing::info!(session = %displaced.session_id, peer = ?displaced.id, "session displaced");
            displaced.disconnect(DisconnectReason::DuplicatePeers);
        }
        self.send_degree();
        Ok(())
    }

    /// Drop a session. Degree is re-advertised if it was active.
    pub fn unregister(&mut self, session: SessionId) -> bool {
        let was_active = self.registry.is_active_session(session);
        let removed = self.registry.remove_session(session).is_some();
        if was_active {
            self.send_degree();
        }
        removed
    }

    pub fn unregister_by_id(&mut self, peer: &str) -> bool {
        if self.registry.remove_by_id(peer).is_none() {
            tracing::info!(peer, "can't remove peer, unknown peer");
            return false;
        }
        self.send_degree();
        true
    }

    pub fn lookup(&self, peer: &str) -> Option<&PeerHandle> {
        self.registry.lookup(peer)
    }

    pub fn count_active(&self) -> usize {
        self.registry.count_active()
    }

    pub fn has_enough_peers(&self) -> bool {
        self.registry.has_enough(self.config.network.opt_num_peers)
    }

    pub(crate) fn broadcast(&self, message: PeerMessage) -> usize {
        let mut sent = 0;
        for peer in self.registry.active_peers() {
            peer.send(message.clone());
            sent += 1;
        }
        sent
    }

    fn send_degree(&self) {
        let degree = self.registry.count_active();
        self.broadcast(PeerMessage::Degree { degree });
    }

    /// Tell the remote why and drop the session right away.
    pub fn disconnect_session(&mut self, session: SessionId, reason: DisconnectReason) {
        if let Some(handle) = self.registry.session(session) {
            tracing::info!(session = %session, peer = ?handle.id, reason = ?reason, "disconnecting peer");
            handle.disconnect(reason);
        }
        self.unregister(session);
    }

    pub fn disconnect_peer(&mut self, peer: &str, reason: DisconnectReason) -> bool {
        match self.registry.active_session_id(peer) {
            Some(session) => {
                self.disconnect_session(session, reason);
                true
            }
            None => false,
        }
    }

    /// Advertised degree of every active peer.
    pub fn peers_degree(&self) -> HashMap<PeerId, usize> {
        self.registry
            .active_peers()
            .filter_map(|p| Some((p.id.clone()?, p.degree)))
            .collect()
    }

    // ── Seed and configuration ───────────────────────────────────────────────

    fn seed(&self) -> Option<HostAddr> {
        if self.config.network.wrong_seed_data() {
            return None;
        }
        self.config.network.seed_endpoint().ok()
    }

    /// Dial the configured seed. Returns false when the seed is unusable.
    pub fn connect_to_network(&mut self) -> bool {
        match self.seed() {
            Some(seed) => {
                tracing::info!(seed = %seed, "connecting to seed");
                self.transport.connect(seed, None);
                true
            }
            None => {
                tracing::info!("no usable seed configured, not connecting");
                false
            }
        }
    }

    pub fn change_config(&mut self, config: MeshlinkConfig) {
        self.rendezvous.set_ttl(config.network.rendezvous_ttl());
        self.config = config;
        if let Some(transfer) = self.resource_transfer.as_mut() {
            transfer.change_config(&self.config);
        }

        let Some(seed) = self.seed() else {
            return;
        };
        let connected = self
            .registry
            .active_peers()
            .any(|p| p.address == seed.address && p.port == seed.port);
        if !connected {
            tracing::info!(seed = %seed, "reconnecting to seed after config change");
            self.transport.connect(seed, None);
        }
    }

    pub fn set_suggested_addr(&mut self, key_id: KeyId, address: String) {
        self.suggested_addrs.insert(key_id, address);
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    /// Ping every active peer that has been quiet for longer than the ping interval.
    pub fn ping_peers(&mut self) {
        let now = self.now();
        let interval = self.config.network.ping_interval();
        for peer in self.registry.active_ids() {
            if let Some(handle) = self.registry.lookup_mut(&peer) {
                if now.saturating_duration_since(handle.last_message_at) > interval {
                    handle.send(PeerMessage::Ping);
                    handle.last_ping_at = Some(now);
                }
            }
        }
    }

    pub(crate) fn record_last_message(&mut self, session: SessionId, kind: &'static str) {
        let now = self.now();
        let Some(handle) = self.registry.session_mut(session) else {
            return;
        };
        handle.last_message_at = now;
        let entry = LastMessage {
            kind,
            key_id: handle.key_id.clone(),
            received_at: now,
            address: handle.address.clone(),
            port: handle.port,
        };
        if let Some(key) = &entry.key_id {
            self.routing.touch(key);
        }
        if self.last_messages.len() >= LAST_MESSAGES {
            self.last_messages.pop_front();
        }
        self.last_messages.push_back(entry);
    }

    pub fn last_messages(&self) -> Vec<LastMessage> {
        self.last_messages.iter().cloned().collect()
    }

    // ── Tick ─────────────────────────────────────────────────────────────────

    /// Periodic work: discovery, then churn, then rendezvous expiry.
    pub fn tick(&mut self) {
        self.sync_network();
        self.remove_old_peers();
        self.sweep_rendezvous();
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub fn status(&self) -> OverlayStatus {
        let now = self.now();
        let peers = self
            .registry
            .active_peers()
            .map(|p| PeerSummary {
                id: p.id.clone().unwrap_or_default(),
                key_id: p.key_id.clone(),
                address: p.address.clone(),
                port: p.port,
                degree: p.degree,
                outbound: p.outbound,
                last_message_secs: now.saturating_duration_since(p.last_message_at).as_secs(),
                established_secs: now.saturating_duration_since(p.established_at).as_secs(),
            })
            .collect();
        let last_messages = self
            .last_messages
            .iter()
            .map(|m| MessageSummary {
                kind: m.kind.to_string(),
                key_id: m.key_id.clone(),
                address: m.address.clone(),
                port: m.port,
                age_secs: now.saturating_duration_since(m.received_at).as_secs(),
            })
            .collect();

        OverlayStatus {
            client_id: self.node.node_id.clone(),
            key_id: self.node.key.clone(),
            super_node: self.node.is_super_node(),
            target_peers: self.config.network.opt_num_peers,
            active_peers: self.registry.count_active(),
            sessions: self.registry.count_sessions(),
            pending_candidates: self.registry.count_candidates(),
            free_candidates: self.registry.count_free(),
            pending_rendezvous: self.rendezvous.len(),
            peers,
            resource_peers: self.get_resource_peers(),
            last_messages,
        }
    }
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayStatus {
    pub client_id: PeerId,
    pub key_id: KeyId,
    pub super_node: bool,
    pub target_peers: usize,
    pub active_peers: usize,
    pub sessions: usize,
    pub pending_candidates: usize,
    pub free_candidates: usize,
    pub pending_rendezvous: usize,
    pub peers: Vec<PeerSummary>,
    pub resource_peers: Vec<ResourcePeerInfo>,
    pub last_messages: Vec<MessageSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub key_id: Option<KeyId>,
    pub address: String,
    pub port: u16,
    pub degree: usize,
    pub outbound: bool,
    pub last_message_secs: u64,
    pub established_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub kind: String,
    pub key_id: Option<KeyId>,
    pub address: String,
    pub port: u16,
    pub age_secs: u64,
}

fn local_descriptor(config: &MeshlinkConfig, identity: &Identity) -> NodeDescriptor {
    let key = identity.key_id();
    let node_id = if config.node.client_id.is_empty() {
        key.clone()
    } else {
        config.node.client_id.clone()
    };
    let listen = config.node.listen_address.as_str();
    let prv_addresses = match listen {
        "" | "0.0.0.0" | "::" => Vec::new(),
        addr => vec![addr.to_string()],
    };
    let pub_addr = Some(config.node.public_address.clone()).filter(|a| !a.is_empty());
    NodeDescriptor {
        node_id,
        key,
        prv_addresses,
        pub_addr,
        prv_port: Some(config.node.listen_port),
        pub_port: Some(config.node.listen_port),
        super_node: config.node.super_node,
    }
}
