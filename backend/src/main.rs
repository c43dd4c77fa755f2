mod api;
mod config;
mod error;
mod models;
mod services;
mod storage;

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::EngineConfig;
use crate::services::broadcast::{Broadcaster, EventBus};
use crate::services::confirmation::IndexerConfirmationWatcher;
use crate::services::indexer::{BlockfrostIndexer, LedgerIndexer};
use crate::services::monitor::UtxoMonitor;
use crate::services::presign::PreSignService;
use crate::services::slot_tracker::SlotTracker;
use crate::services::submission::SubmissionPipeline;
use crate::services::vault::PayloadVault;
use crate::storage::{Persistence, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!(network = config.network.as_str(), "Starting ADA pre-sign engine");

    // refuse to start without a usable master secret
    let vault = Arc::new(
        PayloadVault::new(config.master_secret.as_deref())
            .context("Encryption master key is not usable")?,
    );

    let db_path = format!("{}/ada_presign.db", config.data_dir);
    let store: Arc<dyn Persistence> = Arc::new(
        SqliteStore::new(&db_path).with_context(|| format!("Failed to open database {}", db_path))?,
    );

    let indexer: Arc<dyn LedgerIndexer> = Arc::new(BlockfrostIndexer::new(
        config.network,
        config.blockfrost_api_key.clone(),
        config.indexer_timeout,
    )?);

    let events = Arc::new(EventBus::new());
    let broadcaster: Arc<dyn Broadcaster> = events.clone();

    let slots = Arc::new(SlotTracker::new(indexer.clone(), config.slot_tracker.clone()));
    let source = slots.refresh().await;
    tracing::info!(slot = slots.current_slot(), ?source, "Initial ledger slot");
    let slot_handle = slots.start();

    let monitor = Arc::new(UtxoMonitor::new(
        store.clone(),
        indexer.clone(),
        slots.clone(),
        broadcaster.clone(),
        config.monitor.clone(),
    ));
    let restored = monitor.load_signed()?;
    tracing::info!("Restored {} signed requests into the monitor", restored);
    let monitor_handle = monitor.start();

    let confirmations = Arc::new(IndexerConfirmationWatcher::new(
        store.clone(),
        indexer.clone(),
        broadcaster.clone(),
        config.confirmation.clone(),
    ));

    let recovered = confirmations.recover().await?;
    if recovered.unresolved > 0 {
        tracing::warn!(
            "{} interrupted submissions could not be resolved, retrying on next start",
            recovered.unresolved
        );
    }

    let pipeline = Arc::new(
        SubmissionPipeline::new(
            store.clone(),
            vault.clone(),
            indexer.clone(),
            slots.clone(),
            broadcaster.clone(),
            config.submission.clone(),
        )
        .with_confirmation_watcher(confirmations),
    );

    let presign = Arc::new(PreSignService::new(
        store.clone(),
        vault,
        slots.clone(),
        monitor.clone(),
        broadcaster,
    ));

    let api_state = api::ApiState {
        network: config.network,
        store,
        presign,
        pipeline,
        monitor,
        slots,
        events,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Request lifecycle
        .route("/api/requests", post(api::requests::create_request))
        .route("/api/requests/:request_id", get(api::requests::get_request))
        .route("/api/requests/:request_id/candidate", post(api::requests::build_candidate))
        .route("/api/requests/:request_id/signed", post(api::requests::register_signed))
        .route("/api/requests/:request_id/submit", post(api::requests::submit))
        .route("/api/requests/:request_id/cancel", post(api::requests::cancel))
        .route("/api/submissions/batch", post(api::requests::submit_batch))

        // Monitoring
        .route("/api/monitor", get(api::monitor::list_tracked))
        .route("/api/monitor/:request_id", delete(api::monitor::untrack))
        .route("/api/slot", get(api::monitor::get_slot))
        .route("/api/events", get(api::monitor::stream_events))
        .route("/api/events/recent", get(api::monitor::recent_events))

        .with_state(api_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await.unwrap();

    tracing::info!("ADA pre-sign engine listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor_handle.stop().await;
    slot_handle.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    tracing::info!("Shutting down gracefully...");
}
