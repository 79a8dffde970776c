//! `ordercore-server` binary: loads configuration, picks a store and serves HTTP.

use std::future::IntoFuture;
use std::time::Duration;

use anyhow::Context;
use ordercore::{Catalog, OrderCoordinator, OrderStore, UserDirectory};
use ordercore_memory::InMemoryOrderStore;
use ordercore_postgres::PostgresOrderStore;
use ordercore_server::{router, telemetry, AppConfig, AppState, Backend};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    telemetry::init(config.is_local()).context("installing tracing subscriber")?;
    info!(
        env = %config.env,
        backend = ?config.database.backend,
        "[server.starting] configuration loaded"
    );

    let coordinator_config = config.coordinator_config()?;
    match config.database.backend {
        Backend::Memory => {
            let store = match config.database.lock_timeout() {
                Some(limit) => InMemoryOrderStore::new().with_lock_timeout(limit),
                None => InMemoryOrderStore::new(),
            };
            serve(&config, OrderCoordinator::with_config(store, coordinator_config)).await
        }
        Backend::Postgres => {
            let store =
                PostgresOrderStore::with_config(&config.database.url, config.postgres_config()?)
                    .await
                    .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            store.ping().await.context("checking postgres")?;
            serve(&config, OrderCoordinator::with_config(store, coordinator_config)).await
        }
    }
}

async fn serve<S>(config: &AppConfig, coordinator: OrderCoordinator<S>) -> anyhow::Result<()>
where
    S: OrderStore + Catalog + UserDirectory + 'static,
{
    let app = router(
        AppState::new(coordinator),
        config.http_server.request_timeout(),
    );
    let address = config.http_server.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "[server.listening] accepting connections");

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.await;
            })
            .into_future(),
    );

    shutdown_signal().await;
    info!("[server.draining] shutdown requested, finishing in-flight requests");
    let _ = stop.send(());

    drain(server, config.http_server.shutdown_timeout()).await
}

async fn drain(
    server: tokio::task::JoinHandle<std::io::Result<()>>,
    limit: Duration,
) -> anyhow::Result<()> {
    match tokio::time::timeout(limit, server).await {
        Ok(joined) => {
            joined.context("server task panicked")??;
            info!("[server.stopped] shutdown complete");
        }
        Err(_) => warn!(
            limit_secs = limit.as_secs(),
            "[server.shutdown_timeout] in-flight requests abandoned"
        ),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "[server.signal_error] cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "[server.signal_error] cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
