//! The owner task.
//!
//! `OverlayActor` owns the `OverlayService` and applies commands one at a
//! time. Transport callbacks, inbound messages, timers and API queries all
//! arrive on one queue; queries answer through oneshot channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tracing::Instrument;

use meshlink_core::config::MeshlinkConfig;
use meshlink_core::{HostAddr, KeyId, LocalRank, NodeDescriptor, PeerId, PeerInfo, PeerMessage, ResourcePeerInfo};

use crate::collaborators::{PeerLink, ResourceTransfer, TaskCoordinator};
use crate::error::OverlayError;
use crate::gossip::NeighbourRank;
use crate::registry::SessionId;
use crate::rendezvous::RendezvousRoute;
use crate::resources::ResourceEndpoint;
use crate::service::{OverlayService, OverlayStatus};

/// Capacity of the owner queue.
pub const COMMAND_QUEUE: usize = 1024;

pub enum Command {
    // Transport
    ConnectionEstablished {
        link: Arc<dyn PeerLink>,
        remote: HostAddr,
        outbound: bool,
        reply: oneshot::Sender<SessionId>,
    },
    ConnectionFailed {
        expected: Option<PeerId>,
    },
    ConnectionClosed {
        session: SessionId,
    },
    Inbound {
        session: SessionId,
        message: PeerMessage,
    },

    // Timers
    Tick,
    PingPeers,

    // Network
    ConnectToNetwork,
    ChangeConfig(MeshlinkConfig),
    TryToAddPeer(PeerInfo),
    FindNode {
        key_id: KeyId,
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },

    // Rendezvous
    WantToStartTaskSession {
        key_id: KeyId,
        node: NodeDescriptor,
        conn_id: String,
        super_node: Option<NodeDescriptor>,
        reply: oneshot::Sender<RendezvousRoute>,
    },

    // Gossip and ranking
    SendGossip {
        gossip: Value,
        recipients: Vec<PeerId>,
    },
    DrainGossip(oneshot::Sender<Vec<Value>>),
    BroadcastStopGossip,
    DrainStopGossip(oneshot::Sender<HashSet<PeerId>>),
    PushLocalRank {
        subject: PeerId,
        rank: LocalRank,
    },
    DrainNeighbourRanks(oneshot::Sender<Vec<NeighbourRank>>),

    // Resources
    SetResourceTransfer(Box<dyn ResourceTransfer>),
    SetLocalResourceEndpoint {
        address: String,
        port: u16,
    },
    BroadcastGetResourcePeers,
    PutResource {
        resource: String,
        address: String,
        port: u16,
        copies: u32,
    },
    ExportDirectory(oneshot::Sender<HashMap<PeerId, ResourceEndpoint>>),
    ResourcePeers(oneshot::Sender<Vec<ResourcePeerInfo>>),

    // Tasks
    SetTaskCoordinator(Box<dyn TaskCoordinator>),
    RemoveTask(String),

    // Queries
    PeersDegree(oneshot::Sender<HashMap<PeerId, usize>>),
    Status(oneshot::Sender<OverlayStatus>),
}

/// Cloneable sender side of the owner queue.
#[derive(Clone)]
pub struct OverlayHandle {
    tx: mpsc::Sender<Command>,
}

impl OverlayHandle {
    /// Create the queue. The receiver goes to [`OverlayActor::new`].
    pub fn channel() -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: Command) -> Result<(), OverlayError> {
        self.tx.send(command).await.map_err(|_| OverlayError::OwnerGone)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, OverlayError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| OverlayError::OwnerGone)
    }

    pub async fn connection_established(
        &self,
        link: Arc<dyn PeerLink>,
        remote: HostAddr,
        outbound: bool,
    ) -> Result<SessionId, OverlayError> {
        self.query(|reply| Command::ConnectionEstablished {
            link,
            remote,
            outbound,
            reply,
        })
        .await
    }

    pub async fn connection_failed(&self, expected: Option<PeerId>) -> Result<(), OverlayError> {
        self.send(Command::ConnectionFailed { expected }).await
    }

    pub async fn connection_closed(&self, session: SessionId) -> Result<(), OverlayError> {
        self.send(Command::ConnectionClosed { session }).await
    }

    pub async fn inbound(&self, session: SessionId, message: PeerMessage) -> Result<(), OverlayError> {
        self.send(Command::Inbound { session, message }).await
    }

    pub async fn tick(&self) -> Result<(), OverlayError> {
        self.send(Command::Tick).await
    }

    pub async fn ping_peers(&self) -> Result<(), OverlayError> {
        self.send(Command::PingPeers).await
    }

    pub async fn connect_to_network(&self) -> Result<(), OverlayError> {
        self.send(Command::ConnectToNetwork).await
    }

    pub async fn change_config(&self, config: MeshlinkConfig) -> Result<(), OverlayError> {
        self.send(Command::ChangeConfig(config)).await
    }

    pub async fn try_to_add_peer(&self, info: PeerInfo) -> Result<(), OverlayError> {
        self.send(Command::TryToAddPeer(info)).await
    }

    pub async fn find_node(&self, key_id: KeyId) -> Result<Vec<PeerInfo>, OverlayError> {
        self.query(|reply| Command::FindNode { key_id, reply }).await
    }

    pub async fn want_to_start_task_session(
        &self,
        key_id: KeyId,
        node: NodeDescriptor,
        conn_id: String,
        super_node: Option<NodeDescriptor>,
    ) -> Result<RendezvousRoute, OverlayError> {
        self.query(|reply| Command::WantToStartTaskSession {
            key_id,
            node,
            conn_id,
            super_node,
            reply,
        })
        .await
    }

    pub async fn send_gossip(&self, gossip: Value, recipients: Vec<PeerId>) -> Result<(), OverlayError> {
        self.send(Command::SendGossip { gossip, recipients }).await
    }

    pub async fn drain_gossip(&self) -> Result<Vec<Value>, OverlayError> {
        self.query(Command::DrainGossip).await
    }

    pub async fn broadcast_stop_gossip(&self) -> Result<(), OverlayError> {
        self.send(Command::BroadcastStopGossip).await
    }

    pub async fn drain_stop_gossip(&self) -> Result<HashSet<PeerId>, OverlayError> {
        self.query(Command::DrainStopGossip).await
    }

    pub async fn push_local_rank(&self, subject: PeerId, rank: LocalRank) -> Result<(), OverlayError> {
        self.send(Command::PushLocalRank { subject, rank }).await
    }

    pub async fn drain_neighbour_ranks(&self) -> Result<Vec<NeighbourRank>, OverlayError> {
        self.query(Command::DrainNeighbourRanks).await
    }

    pub async fn set_resource_transfer(&self, transfer: Box<dyn ResourceTransfer>) -> Result<(), OverlayError> {
        self.send(Command::SetResourceTransfer(transfer)).await
    }

    pub async fn set_local_resource_endpoint(&self, address: String, port: u16) -> Result<(), OverlayError> {
        self.send(Command::SetLocalResourceEndpoint { address, port }).await
    }

    pub async fn broadcast_get_resource_peers(&self) -> Result<(), OverlayError> {
        self.send(Command::BroadcastGetResourcePeers).await
    }

    pub async fn put_resource(
        &self,
        resource: String,
        address: String,
        port: u16,
        copies: u32,
    ) -> Result<(), OverlayError> {
        self.send(Command::PutResource {
            resource,
            address,
            port,
            copies,
        })
        .await
    }

    pub async fn export_directory(&self) -> Result<HashMap<PeerId, ResourceEndpoint>, OverlayError> {
        self.query(Command::ExportDirectory).await
    }

    pub async fn resource_peers(&self) -> Result<Vec<ResourcePeerInfo>, OverlayError> {
        self.query(Command::ResourcePeers).await
    }

    pub async fn set_task_coordinator(&self, tasks: Box<dyn TaskCoordinator>) -> Result<(), OverlayError> {
        self.send(Command::SetTaskCoordinator(tasks)).await
    }

    pub async fn remove_task(&self, task_id: String) -> Result<(), OverlayError> {
        self.send(Command::RemoveTask(task_id)).await
    }

    pub async fn peers_degree(&self) -> Result<HashMap<PeerId, usize>, OverlayError> {
        self.query(Command::PeersDegree).await
    }

    pub async fn status(&self) -> Result<OverlayStatus, OverlayError> {
        self.query(Command::Status).await
    }
}

pub struct OverlayActor {
    service: OverlayService,
    commands: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
    span: tracing::Span,
}

impl OverlayActor {
    pub fn new(
        service: OverlayService,
        commands: mpsc::Receiver<Command>,
        shutdown: broadcast::Receiver<()>,
        span: tracing::Span,
    ) -> Self {
        Self {
            service,
            commands,
            shutdown,
            span,
        }
    }

    /// Run until shutdown or until every handle is dropped. Returns the
    /// service so callers can inspect final state.
    pub async fn run(self) -> OverlayService {
        let span = self.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> OverlayService {
        let tick_period = self.service.config.network.tick_interval();
        let ping_period = self.service.config.network.ping_interval();
        let mut tick = interval_at(TokioInstant::now() + tick_period, tick_period);
        let mut ping = interval_at(TokioInstant::now() + ping_period, ping_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            client_id = %self.service.client_id(),
            key_id = %self.service.key_id(),
            "overlay started"
        );
        self.service.connect_to_network();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("overlay shutting down");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = tick.tick() => self.service.tick(),
                _ = ping.tick() => self.service.ping_peers(),
            }
        }
        self.service
    }

    fn apply(&mut self, command: Command) {
        let service = &mut self.service;
        match command {
            Command::ConnectionEstablished {
                link,
                remote,
                outbound,
                reply,
            } => {
                let session = service.connection_established(link, remote, outbound);
                if reply.send(session).is_err() {
                    service.connection_closed(session);
                }
            }
            Command::ConnectionFailed { expected } => service.connection_failed(expected),
            Command::ConnectionClosed { session } => service.connection_closed(session),
            Command::Inbound { session, message } => service.handle_message(session, message),

            Command::Tick => service.tick(),
            Command::PingPeers => service.ping_peers(),

            Command::ConnectToNetwork => {
                service.connect_to_network();
            }
            Command::ChangeConfig(config) => service.change_config(config),
            Command::TryToAddPeer(info) => {
                service.try_to_add_peer(info);
            }
            Command::FindNode { key_id, reply } => {
                let _ = reply.send(service.find_node(&key_id));
            }

            Command::WantToStartTaskSession {
                key_id,
                node,
                conn_id,
                super_node,
                reply,
            } => {
                let route = service.want_to_start_task_session(&key_id, node, conn_id, super_node);
                let _ = reply.send(route);
            }

            Command::SendGossip { gossip, recipients } => {
                service.send_gossip(&gossip, &recipients);
            }
            Command::DrainGossip(reply) => {
                let _ = reply.send(service.drain_gossip());
            }
            Command::BroadcastStopGossip => {
                service.broadcast_stop_gossip();
            }
            Command::DrainStopGossip(reply) => {
                let _ = reply.send(service.drain_stop_gossip());
            }
            Command::PushLocalRank { subject, rank } => {
                service.push_local_rank(subject, rank);
            }
            Command::DrainNeighbourRanks(reply) => {
                let _ = reply.send(service.drain_neighbour_ranks());
            }

            Command::SetResourceTransfer(transfer) => service.set_resource_transfer(transfer),
            Command::SetLocalResourceEndpoint { address, port } => {
                service.set_local_resource_endpoint(address, port)
            }
            Command::BroadcastGetResourcePeers => {
                service.broadcast_get_resource_peers();
            }
            Command::PutResource {
                resource,
                address,
                port,
                copies,
            } => {
                service.relay_put_resource(resource, address, port, copies);
            }
            Command::ExportDirectory(reply) => {
                let _ = reply.send(service.export_directory());
            }
            Command::ResourcePeers(reply) => {
                let _ = reply.send(service.get_resource_peers());
            }

            Command::SetTaskCoordinator(tasks) => service.set_task_coordinator(tasks),
            Command::RemoveTask(task_id) => {
                service.remove_task(&task_id);
            }

            Command::PeersDegree(reply) => {
                let _ = reply.send(service.peers_degree());
            }
            Command::Status(reply) => {
                let _ = reply.send(service.status());
            }
        }
    }
}
