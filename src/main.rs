mod config;
mod db;
mod message;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use config::{Config, IdentityMode, StoreBackend};
use services::board_store::{BoardStore, MemoryBoardStore, PgBoardStore};
use services::hub::Hub;
use services::identity::{DevVerifier, IdentityVerifier, TicketVerifier};
use services::persistence::{PersistenceBatcher, spawn_flush_task};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env().expect("invalid configuration");
    let (store, verifier) = init_backends(&config).await;

    let batcher = PersistenceBatcher::new(store.clone());
    let (hub, _hub_task) = Hub::spawn(store, batcher.clone(), config.hub_queue_capacity);
    let flush_task = spawn_flush_task(batcher.clone(), config.flush_interval);

    let state = state::AppState::new(hub, verifier, config.session);
    let app = routes::app(state);

    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "boardsync listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // Let an in-flight cycle land, then persist what the last interval accumulated.
    flush_task.shutdown().await;
    let report = batcher.flush().await;
    tracing::info!(appended = report.appended, failed = report.failed, "final flush complete");
}

/// `Config::from_env` rejects ticket identity without Postgres, so a missing
/// pool here always means dev identity.
async fn init_backends(config: &Config) -> (Arc<dyn BoardStore>, Arc<dyn IdentityVerifier>) {
    let pool = match (config.store_backend, config.database_url.as_deref()) {
        (StoreBackend::Postgres, Some(url)) => Some(
            db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed"),
        ),
        _ => None,
    };

    let store: Arc<dyn BoardStore> = match &pool {
        Some(pool) => Arc::new(PgBoardStore::new(pool.clone())),
        None => {
            tracing::warn!("using in-memory board store; boards are lost on restart");
            Arc::new(MemoryBoardStore::new())
        }
    };

    let verifier: Arc<dyn IdentityVerifier> = match (config.identity_mode, pool) {
        (IdentityMode::Ticket, Some(pool)) => Arc::new(TicketVerifier::new(pool)),
        (IdentityMode::Ticket, None) => unreachable!("config validation requires postgres for ticket identity"),
        (IdentityMode::Dev, _) => {
            tracing::warn!("dev identity mode: credentials are user ids, do not expose publicly");
            Arc::new(DevVerifier)
        }
    };

    (store, verifier)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
