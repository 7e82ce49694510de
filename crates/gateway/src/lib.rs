pub mod access;
pub mod app_state;
pub mod config;
pub mod director;
pub mod error;
pub mod factory;
pub mod hijack;
pub mod http;
pub mod metrics;
pub mod stores;
pub mod telemetry;
pub mod tokens;
pub mod transport;
pub mod tunnel;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::access::AccessControlEngine;
use crate::app_state::AppState;
use crate::factory::ProxyFactory;
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::stores::{
    EndpointStore, ResourceControlStore, SessionValidator, SnapshotStore, TokenIssuer,
};
use crate::tokens::TokenCacheRegistry;
use crate::tunnel::TunnelRegistry;

/// External collaborators the gateway is wired to at startup. Production
/// deployments pass adapters to the real data store and token service; the
/// default binary wires the in-memory implementations.
#[derive(Clone)]
pub struct GatewayStores {
    pub endpoints: Arc<dyn EndpointStore>,
    pub controls: Arc<dyn ResourceControlStore>,
    pub sessions: Arc<dyn SessionValidator>,
    pub issuer: Arc<dyn TokenIssuer>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl From<stores::memory::MemoryStores> for GatewayStores {
    fn from(stores: stores::memory::MemoryStores) -> Self {
        Self {
            endpoints: stores.endpoints,
            controls: stores.controls,
            sessions: stores.sessions,
            issuer: stores.issuer,
            snapshots: stores.snapshots,
        }
    }
}

/// Boot the gateway with the given store wiring.
pub async fn run(stores: GatewayStores) -> Result<()> {
    run_with_shutdown(stores, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(stores: GatewayStores, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();
    record_build_info();

    let factory = ProxyFactory::new(
        stores.snapshots.clone(),
        TokenCacheRegistry::new(stores.issuer.clone()),
        TunnelRegistry::new(),
        Duration::from_secs(app_config.tunnel.resolve_wait_secs),
        Duration::from_millis(app_config.tunnel.poll_interval_ms),
        Duration::from_secs(app_config.hijack.keepalive_secs),
        app_config.agent.shared_secret.clone(),
    );
    let engine = AccessControlEngine::new(stores.controls.clone());

    let state = AppState::new(
        stores.endpoints,
        stores.sessions,
        engine,
        factory,
        &app_config,
        Some(metrics_handle),
    );

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app = http::build_router(state.clone());
    let metrics_app = http::build_metrics_router(state);

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "gateway listening");
    info!(%metrics_addr, "gateway metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    // Whichever server exits first takes the other down with it; the sibling
    // task is drained so its error is not lost.
    tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("gateway task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("gateway server failed: {err}"))?;
            metrics_task
                .await
                .map_err(|err| anyhow::anyhow!("gateway metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("gateway metrics server failed: {err}"))?;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("gateway metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("gateway metrics server failed: {err}"))?;
            api_task
                .await
                .map_err(|err| anyhow::anyhow!("gateway task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("gateway server failed: {err}"))?;
        }
    }

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
