use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use simgate::caps::{CapsRegistry, CapsState, router};
use simgate::services::{MemoryAssetStore, MemoryInventory, ServiceUrls, StaticAgentServices};
use simgate::{AssetStore, DispatcherEvent, LocalScene, Scene, SocketDispatcher};

use crate::config::ServerConfig;

/// A single-region simulator: the UDP dispatcher plus the capability
/// HTTP server sharing one capability registry.
pub struct SimServer {
    dispatcher: Arc<SocketDispatcher>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SimServer {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let registry = Arc::new(CapsRegistry::new());
        let services = Arc::new(StaticAgentServices::new(
            Some(Arc::new(MemoryAssetStore::new()) as Arc<dyn AssetStore>),
            Arc::new(MemoryInventory::new()),
            ServiceUrls {
                home_uri: config.grid.home_uri.clone(),
                inventory_uri: config.grid.inventory_uri.clone(),
            },
        ));
        let scene: Arc<dyn Scene> = Arc::new(LocalScene::new(
            config.scene.name.clone(),
            (config.scene.grid_x, config.scene.grid_y),
        ));

        let dispatcher = SocketDispatcher::bind(
            config.udp_bind,
            Arc::new(config.circuit.clone()),
            config.max_circuits,
            registry.clone(),
            services,
        )
        .await
        .with_context(|| format!("binding UDP socket {}", config.udp_bind))?;
        dispatcher.spawn();

        let listener = TcpListener::bind(config.http_bind)
            .await
            .with_context(|| format!("binding HTTP listener {}", config.http_bind))?;
        let http_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let app = router(CapsState {
            router: registry,
            config: Arc::new(config.caps.clone()),
            dispatcher: Some(dispatcher.clone()),
            scene: Some(scene),
        });

        let mut tasks = Vec::new();
        let shutdown = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(err) = served {
                warn!("capability server stopped: {}", err);
            }
        }));
        if let Some(events) = dispatcher.take_events() {
            tasks.push(tokio::spawn(log_events(events)));
        }
        tasks.push(tokio::spawn(log_stats(
            dispatcher.clone(),
            Duration::from_secs(config.stats_interval_secs.max(1)),
            cancel.clone(),
        )));

        info!(
            "region '{}' listening on udp {} and http {}",
            config.scene.name,
            dispatcher.local_addr(),
            http_addr
        );
        Ok(Self {
            dispatcher,
            http_addr,
            cancel,
            tasks,
        })
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub async fn shutdown(self) {
        let Self {
            dispatcher,
            cancel,
            tasks,
            ..
        } = self;
        dispatcher.shutdown().await;
        cancel.cancel();
        // The event log ends once the last dispatcher handle is gone.
        drop(dispatcher);
        for task in tasks {
            if let Err(err) = task.await {
                warn!("server task ended abnormally: {}", err);
            }
        }
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<DispatcherEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DispatcherEvent::CircuitBound {
                code,
                agent_id,
                addr,
            } => {
                info!("agent {} bound circuit {} from {}", agent_id, code, addr);
            }
            DispatcherEvent::CircuitClosed {
                code,
                agent_id,
                reason,
            } => {
                info!(
                    "agent {} circuit {} closed: {}",
                    agent_id,
                    code,
                    reason.as_str()
                );
            }
            DispatcherEvent::HandshakeRejected { addr, reason } => {
                warn!("handshake from {} rejected: {}", addr, reason);
            }
        }
    }
}

async fn log_stats(
    dispatcher: Arc<SocketDispatcher>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let (pending, bound) = dispatcher.circuit_counts();
                let stats = dispatcher.stats();
                info!(
                    "circuits: {} bound, {} pending | packets in {} out {} dropped {} | bytes in {} out {}",
                    bound,
                    pending,
                    stats.packets_received,
                    stats.packets_sent,
                    stats.packets_dropped,
                    stats.bytes_received,
                    stats.bytes_sent
                );
            }
        }
    }
}
