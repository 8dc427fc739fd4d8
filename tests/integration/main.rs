//! meshlink integration test harness.
//!
//! Each test drives a real `OverlayActor` through its `OverlayHandle`. Links
//! are in memory, dials are only recorded, routing answers are scripted and
//! time moves when the test advances the clock. The actor's own timers are
//! parked an hour out; ticks are issued explicitly.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use meshlink_core::config::MeshlinkConfig;
use meshlink_core::{PeerInfo, PeerMessage};
use meshlink_services::testing::{
    hello, node, test_config, Harness, ManualClock, MemoryLink, RecordingTransport,
    ScriptedRouting,
};
use meshlink_services::{OverlayActor, OverlayHandle, OverlayService, OverlayStatus, SessionId};

mod churn;
mod discovery;
mod gossip;
mod rendezvous;
mod resources;
mod startup;

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn quiet_config() -> MeshlinkConfig {
    let mut config = test_config();
    config.network.tick_interval_ms = 3_600_000;
    config.network.ping_interval_secs = 3_600;
    config
}

/// A peer entry as it would arrive in a peers list.
pub fn info(id: &str) -> PeerInfo {
    PeerInfo {
        id: id.to_string(),
        address: format!("{id}.lan"),
        port: 40102,
        node: node(id),
    }
}

/// One running overlay node and the collaborators it was built with.
pub struct Node {
    pub handle: OverlayHandle,
    pub transport: Arc<RecordingTransport>,
    pub routing: ScriptedRouting,
    pub clock: Arc<ManualClock>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<OverlayService>,
}

impl Node {
    pub fn start(config: MeshlinkConfig) -> Self {
        Self::from_harness(Harness::new(config))
    }

    pub fn from_harness(h: Harness) -> Self {
        let Harness {
            service,
            transport,
            routing,
            clock,
            ..
        } = h;
        let (handle, commands) = OverlayHandle::channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let actor = OverlayActor::new(
            service,
            commands,
            shutdown_rx,
            tracing::info_span!("node", id = "local"),
        );
        Self {
            handle,
            transport,
            routing,
            clock,
            shutdown,
            task: tokio::spawn(actor.run()),
        }
    }

    /// Status round trip. Everything queued before it has been applied.
    pub async fn status(&self) -> OverlayStatus {
        self.handle.status().await.unwrap()
    }

    pub async fn tick(&self) -> OverlayStatus {
        self.handle.tick().await.unwrap();
        self.status().await
    }

    pub async fn deliver(&self, session: SessionId, message: PeerMessage) {
        self.handle.inbound(session, message).await.unwrap();
    }

    /// Inbound session from `id`, hello completed.
    pub async fn connect_inbound(&self, id: &str) -> (SessionId, Arc<MemoryLink>) {
        let link = MemoryLink::new();
        let session = self
            .handle
            .connection_established(
                link.clone(),
                meshlink_core::HostAddr::new(format!("{id}.lan"), 5000),
                false,
            )
            .await
            .unwrap();
        self.deliver(session, hello(id)).await;
        self.status().await;
        (session, link)
    }

    /// Answer every recorded dial with a connected session and the expected peer's hello.
    pub async fn complete_dials(&self) -> Vec<(String, SessionId, Arc<MemoryLink>)> {
        let mut opened = Vec::new();
        for request in self.transport.take_requests() {
            let Some(id) = request.expected else {
                continue;
            };
            let link = MemoryLink::new();
            let session = self
                .handle
                .connection_established(link.clone(), request.hosts[0].clone(), true)
                .await
                .unwrap();
            self.deliver(session, hello(&id)).await;
            opened.push((id, session, link));
        }
        self.status().await;
        opened
    }

    /// Report every recorded dial as failed.
    pub async fn fail_dials(&self) -> usize {
        let requests = self.transport.take_requests();
        for request in &requests {
            self.handle
                .connection_failed(request.expected.clone())
                .await
                .unwrap();
        }
        self.status().await;
        requests.len()
    }

    pub async fn stop(self) -> OverlayService {
        self.shutdown.send(()).unwrap();
        self.task.await.unwrap()
    }
}
