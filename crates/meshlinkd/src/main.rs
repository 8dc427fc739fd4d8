//! meshlinkd: overlay node daemon.

mod status;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use meshlink_core::config::MeshlinkConfig;
use meshlink_core::{Identity, LocalKeys};
use meshlink_services::{
    Clock, FlatRoutingTable, OverlayActor, OverlayHandle, OverlayService, SystemClock,
};

use status::StatusState;
use transport::TcpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = MeshlinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = MeshlinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshlinkConfig::default()
    });

    let keys = LocalKeys::generate();
    if config.node.client_id.is_empty() {
        config.node.client_id = keys.derived_client_id();
    }
    let identity = Identity::new(Arc::new(keys));
    tracing::info!(
        client_id = %config.node.client_id,
        key_id = %identity.key_id(),
        "keys ready"
    );

    let listener = TcpListener::bind((config.node.listen_address.as_str(), config.node.listen_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind peer listener on {}:{}",
                config.node.listen_address, config.node.listen_port
            )
        })?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let (handle, commands) = OverlayHandle::channel();
    let transport = Arc::new(TcpTransport::new(handle.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let routing = Box::new(FlatRoutingTable::new(identity.key_id(), clock.clone()));
    let mut service = OverlayService::new(config.clone(), identity, transport, routing, clock);

    if config.resources.resource_port != 0 {
        let advertised = if config.node.public_address.is_empty() {
            config.node.listen_address.clone()
        } else {
            config.node.public_address.clone()
        };
        service.set_local_resource_endpoint(advertised, config.resources.resource_port);
    }

    let span = tracing::info_span!("node", id = %config.node.client_id);
    let actor_task = tokio::spawn(
        OverlayActor::new(service, commands, shutdown_tx.subscribe(), span).run(),
    );
    let accept_task = tokio::spawn(transport::accept_loop(
        listener,
        handle.clone(),
        shutdown_tx.subscribe(),
    ));
    let status_task = tokio::spawn(status::serve(
        StatusState { overlay: handle },
        config.api.port,
        shutdown_tx.subscribe(),
    ));

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = actor_task         => tracing::error!("overlay task exited: {:?}", r.map(|s| s.count_active())),
        r = accept_task        => tracing::error!("listener task exited: {:?}", r),
        r = status_task        => tracing::error!("status task exited: {:?}", r),
    }

    Ok(())
}
