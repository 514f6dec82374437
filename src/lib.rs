//! Conductor - delegate task dispatch and resource constraint throttling

pub mod api;
pub mod clock;
pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod error;
pub mod selection;
pub mod store;
pub mod task;
pub mod throttle;
pub mod websocket;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::DispatchSettings;
use crate::delegate::DelegateRegistry;
use crate::dispatch::TaskDispatchCoordinator;
use crate::selection::{CapabilityMatcher, ConnectionWhitelist, SelectionLogService};
use crate::store::Store;
use crate::throttle::ResourceConstraintThrottle;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub registry: Arc<DelegateRegistry>,
    pub coordinator: Arc<TaskDispatchCoordinator>,
    pub throttle: Arc<ResourceConstraintThrottle>,
    pub selection_logs: Arc<SelectionLogService>,
}

impl AppState {
    pub fn new(pool: SqlitePool, settings: DispatchSettings, clock: Arc<dyn Clock>) -> Arc<Self> {
        let store = Store::new(pool);
        let registry = Arc::new(DelegateRegistry::new(
            store.clone(),
            clock.clone(),
            settings.max_heartbeat_age,
        ));
        let matcher = Arc::new(CapabilityMatcher::new(registry.clone(), clock.clone()));
        let whitelist = Arc::new(ConnectionWhitelist::new(
            store.clone(),
            clock.clone(),
            settings.clone(),
            registry.clone(),
            matcher.clone(),
        ));
        let selection_logs = Arc::new(SelectionLogService::new(
            store.clone(),
            clock.clone(),
            settings.selection_logs_enabled,
        ));
        let coordinator = Arc::new(TaskDispatchCoordinator::new(
            store.clone(),
            clock.clone(),
            settings,
            registry.clone(),
            matcher,
            whitelist,
            selection_logs.clone(),
        ));
        let throttle = Arc::new(ResourceConstraintThrottle::new(store.clone(), clock));

        Arc::new(Self {
            store,
            registry,
            coordinator,
            throttle,
            selection_logs,
        })
    }
}

/// All HTTP and websocket routes, without middleware
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api::routes())
        .route(
            "/accounts/:account/delegates/:delegate_id/stream",
            get(websocket::handler),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
