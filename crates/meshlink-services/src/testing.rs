//! In-memory collaborators for driving the overlay without sockets.
//!
//! Built for unit tests and, behind the `testing` feature, for the
//! integration suite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use meshlink_core::config::MeshlinkConfig;
use meshlink_core::message::PROTOCOL_VERSION;
use meshlink_core::{
    DisconnectReason, HostAddr, Identity, KeyId, LocalKeys, NodeDescriptor, PeerId, PeerMessage,
    TaskHeader,
};

use crate::collaborators::{
    Clock, KnownNode, PeerLink, ResourceTransfer, RoutingTable, TaskCoordinator, Transport,
};
use crate::registry::SessionId;
use crate::resources::ResourceEndpoint;
use crate::service::OverlayService;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

pub fn test_config() -> MeshlinkConfig {
    let mut config = MeshlinkConfig::default();
    config.node.client_id = "local".to_string();
    config
}

pub fn key_of(id: &str) -> KeyId {
    format!("key-{id}")
}

pub fn node(id: &str) -> NodeDescriptor {
    NodeDescriptor {
        node_id: id.to_string(),
        key: key_of(id),
        prv_addresses: vec![format!("{id}.lan")],
        pub_addr: None,
        prv_port: Some(40102),
        pub_port: None,
        super_node: false,
    }
}

pub fn known(id: &str) -> KnownNode {
    KnownNode {
        id: id.to_string(),
        key_id: key_of(id),
        address: format!("{id}.lan"),
        port: 40102,
        node: node(id),
    }
}

pub fn hello(id: &str) -> PeerMessage {
    PeerMessage::Hello {
        port: 40102,
        client_id: id.to_string(),
        key_id: key_of(id),
        node: node(id),
        proto_version: PROTOCOL_VERSION,
    }
}

pub fn test_identity() -> Identity {
    Identity::new(Arc::new(LocalKeys::from_secrets([1u8; 32], [2u8; 32])))
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *lock(&self.offset)
    }
}

// ── Links and transport ───────────────────────────────────────────────────────

/// Records everything sent on one session.
#[derive(Default)]
pub struct MemoryLink {
    sent: Mutex<Vec<PeerMessage>>,
    disconnected: Mutex<Option<DisconnectReason>>,
}

impl MemoryLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shared() -> Arc<dyn PeerLink> {
        Self::new()
    }

    pub fn sent(&self) -> Vec<PeerMessage> {
        lock(&self.sent).clone()
    }

    pub fn take_sent(&self) -> Vec<PeerMessage> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        lock(&self.sent).iter().map(PeerMessage::kind).collect()
    }

    /// Degrees advertised to this peer, in order.
    pub fn degrees(&self) -> Vec<usize> {
        lock(&self.sent)
            .iter()
            .filter_map(|m| match m {
                PeerMessage::Degree { degree } => Some(*degree),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *lock(&self.disconnected)
    }
}

impl PeerLink for MemoryLink {
    fn send(&self, message: PeerMessage) {
        lock(&self.sent).push(message);
    }

    fn disconnect(&self, reason: DisconnectReason) {
        lock(&self.sent).push(PeerMessage::Disconnect { reason });
        *lock(&self.disconnected) = Some(reason);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub hosts: Vec<HostAddr>,
    pub expected: Option<PeerId>,
}

/// Records dial requests. Nothing is actually dialed.
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<ConnectRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        lock(&self.requests).clone()
    }

    pub fn take_requests(&self) -> Vec<ConnectRequest> {
        std::mem::take(&mut *lock(&self.requests))
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, addr: HostAddr, expected: Option<PeerId>) {
        lock(&self.requests).push(ConnectRequest {
            hosts: vec![addr],
            expected,
        });
    }

    fn connect_to_host(&self, hosts: Vec<HostAddr>, expected: Option<PeerId>) {
        lock(&self.requests).push(ConnectRequest { hosts, expected });
    }
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RoutingScript {
    /// Handed out by `random_known_node`, front first.
    pub known: Vec<KnownNode>,
    /// Returned once by the next `sync_network`.
    pub lookups: HashMap<KeyId, Vec<KnownNode>>,
    pub neighbours: Vec<KnownNode>,
    pub sessions_to_end: Vec<PeerId>,
    /// Returned by the next `add_peer`.
    pub ping_candidate: Option<KnownNode>,
    pub added: Vec<PeerId>,
    pub pongs: Vec<KeyId>,
    pub touched: Vec<KeyId>,
    pub syncs: usize,
}

/// Routing table whose answers are set by the test.
#[derive(Clone, Default)]
pub struct ScriptedRouting {
    script: Arc<Mutex<RoutingScript>>,
}

impl ScriptedRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> MutexGuard<'_, RoutingScript> {
        lock(&self.script)
    }
}

impl RoutingTable for ScriptedRouting {
    fn add_peer(
        &mut self,
        _key_id: &KeyId,
        id: &PeerId,
        _address: &str,
        _port: u16,
        _node: &NodeDescriptor,
    ) -> Option<KnownNode> {
        let mut script = lock(&self.script);
        script.added.push(id.clone());
        script.ping_candidate.take()
    }

    fn pong_received(&mut self, key_id: &KeyId, _id: &PeerId, _address: &str, _port: u16) {
        lock(&self.script).pongs.push(key_id.clone());
    }

    fn touch(&mut self, key_id: &KeyId) {
        lock(&self.script).touched.push(key_id.clone());
    }

    fn neighbours(&self, _key_id: &KeyId) -> Vec<KnownNode> {
        lock(&self.script).neighbours.clone()
    }

    fn random_known_node(&mut self) -> Option<KnownNode> {
        let mut script = lock(&self.script);
        if script.known.is_empty() {
            None
        } else {
            Some(script.known.remove(0))
        }
    }

    fn sync_network(&mut self) -> HashMap<KeyId, Vec<KnownNode>> {
        let mut script = lock(&self.script);
        script.syncs += 1;
        std::mem::take(&mut script.lookups)
    }

    fn sessions_to_end(&self) -> Vec<PeerId> {
        lock(&self.script).sessions_to_end.clone()
    }

    fn clear_sessions_to_end(&mut self) {
        lock(&self.script).sessions_to_end.clear();
    }
}

// ── Task coordinator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StartedSession {
    pub node: NodeDescriptor,
    pub super_node: Option<NodeDescriptor>,
    pub conn_id: String,
}

#[derive(Default)]
pub struct TaskState {
    pub headers: Vec<TaskHeader>,
    pub added: Vec<TaskHeader>,
    pub removed: Vec<String>,
    pub sessions: Vec<StartedSession>,
    /// Task ids `add_task_header` refuses.
    pub reject: Vec<String>,
}

#[derive(Clone, Default)]
pub struct RecordingTasks {
    state: Arc<Mutex<TaskState>>,
}

impl RecordingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, TaskState> {
        lock(&self.state)
    }
}

impl TaskCoordinator for RecordingTasks {
    fn task_headers(&self) -> Vec<TaskHeader> {
        lock(&self.state).headers.clone()
    }

    fn add_task_header(&mut self, header: TaskHeader) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if state.reject.contains(&header.task_id) {
            anyhow::bail!("task {} rejected", header.task_id);
        }
        state.added.push(header);
        Ok(())
    }

    fn remove_task_header(&mut self, task_id: &str) {
        lock(&self.state).removed.push(task_id.to_string());
    }

    fn start_task_session(
        &mut self,
        node: NodeDescriptor,
        super_node: Option<NodeDescriptor>,
        conn_id: String,
    ) {
        lock(&self.state).sessions.push(StartedSession {
            node,
            super_node,
            conn_id,
        });
    }
}

// ── Resource transfer ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub resource: String,
    pub address: String,
    pub port: u16,
    pub copies: u32,
}

#[derive(Default)]
pub struct ResourceState {
    pub directories: Vec<HashMap<PeerId, ResourceEndpoint>>,
    pub puts: Vec<PutRequest>,
    pub config_changes: usize,
}

#[derive(Clone, Default)]
pub struct RecordingResources {
    state: Arc<Mutex<ResourceState>>,
}

impl RecordingResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ResourceState> {
        lock(&self.state)
    }
}

impl ResourceTransfer for RecordingResources {
    fn set_resource_peers(&mut self, peers: HashMap<PeerId, ResourceEndpoint>) {
        lock(&self.state).directories.push(peers);
    }

    fn put_resource(&mut self, resource: String, address: String, port: u16, copies: u32) {
        lock(&self.state).puts.push(PutRequest {
            resource,
            address,
            port,
            copies,
        });
    }

    fn change_config(&mut self, _config: &MeshlinkConfig) {
        lock(&self.state).config_changes += 1;
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

/// An `OverlayService` wired to in-memory collaborators.
pub struct Harness {
    pub service: OverlayService,
    pub transport: Arc<RecordingTransport>,
    pub routing: ScriptedRouting,
    pub clock: Arc<ManualClock>,
    next_port: u16,
}

impl Harness {
    pub fn new(config: MeshlinkConfig) -> Self {
        let transport = RecordingTransport::new();
        let routing = ScriptedRouting::new();
        let clock = ManualClock::new();
        let service = OverlayService::new(
            config,
            test_identity(),
            transport.clone(),
            Box::new(routing.clone()),
            clock.clone(),
        );
        Self {
            service,
            transport,
            routing,
            clock,
            next_port: 50000,
        }
    }

    pub fn attach_tasks(&mut self) -> RecordingTasks {
        let tasks = RecordingTasks::new();
        self.service.set_task_coordinator(Box::new(tasks.clone()));
        tasks
    }

    pub fn attach_resources(&mut self) -> RecordingResources {
        let resources = RecordingResources::new();
        self.service.set_resource_transfer(Box::new(resources.clone()));
        resources
    }

    /// Open an inbound session from `id` and complete its hello.
    pub fn connect_peer(&mut self, id: &str) -> (SessionId, Arc<MemoryLink>) {
        let link = MemoryLink::new();
        self.next_port += 1;
        let session = self.service.connection_established(
            link.clone(),
            HostAddr::new(format!("{id}.lan"), self.next_port),
            false,
        );
        self.deliver(session, hello(id));
        (session, link)
    }

    pub fn deliver(&mut self, session: SessionId, message: PeerMessage) {
        self.service.handle_message(session, message);
    }
}
