//! Conductor server - delegate task dispatch and resource constraint throttling

use clap::Parser;
use conductor::clock::SystemClock;
use conductor::config::Config;
use conductor::dispatch::scheduler;
use conductor::store::Store;
use conductor::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    let settings = config.settings();

    // Database connection
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    // Run migrations
    Store::new(pool.clone()).migrate().await?;

    let state = AppState::new(pool, settings.clone(), Arc::new(SystemClock));

    let period = settings
        .rebroadcast_interval
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(5));
    let _scheduler = scheduler::spawn(state.coordinator.clone(), state.throttle.clone(), period);

    // Build router
    let app = conductor::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
