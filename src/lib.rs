//! FediCourier - ActivityPub outbound delivery with a durable retry queue
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Delivery request / status / async trigger                │
//! │  - Signed inbox endpoints                                   │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - Dispatcher (fan-out, fast path)                          │
//! │  - Retry scheduler + worker pool                            │
//! │  - HTTP Signatures, transport, key cache                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): delivery queue, actors, followers         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: delivery pipeline and HTTP Signatures
//! - `data`: database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use federation::{
    ActivityDelivery, DeliveryDispatcher, DeliveryJob, DeliveryTrigger, FederationRegistry,
    HttpTransport, KeyResolver, PublicKeyCache, RetryScheduler,
};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    pub dispatcher: DeliveryDispatcher,

    pub scheduler: RetryScheduler,

    /// Hands tokens to the worker pool
    pub trigger: DeliveryTrigger,

    /// Remote actor keys for inbound verification
    pub public_keys: Arc<dyn KeyResolver>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the outbound transport and the remote key cache
    /// 3. Wire the registry, scheduler and dispatcher
    ///
    /// # Returns
    /// The state and the job receiver to pass to `start_background_tasks`.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, UnboundedReceiver<DeliveryJob>), error::AppError> {
        let transport = HttpTransport::new(&config.delivery)?;
        let key_cache = PublicKeyCache::new(
            transport.client().clone(),
            Some(config.federation.key_cache_ttl()),
        );
        Self::with_key_resolver(config, transport, Arc::new(key_cache)).await
    }

    /// Like `new`, with an explicit transport and key resolver.
    pub async fn with_key_resolver(
        config: config::AppConfig,
        transport: HttpTransport,
        public_keys: Arc<dyn KeyResolver>,
    ) -> Result<(Self, UnboundedReceiver<DeliveryJob>), error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let registry = FederationRegistry::from_database(db.clone());
        let delivery = ActivityDelivery::new(transport, registry.signing_keys.clone());
        let scheduler = RetryScheduler::new(db.clone(), delivery);
        let (trigger, jobs) = DeliveryTrigger::channel();
        let dispatcher = DeliveryDispatcher::new(
            registry,
            db.clone(),
            scheduler.clone(),
            trigger.clone(),
            config.delivery.fast_path_timeout(),
        );

        tracing::info!("Application state initialized successfully");

        Ok((
            Self {
                config: Arc::new(config),
                db,
                dispatcher,
                scheduler,
                trigger,
                public_keys,
            },
            jobs,
        ))
    }

    /// Spawn the worker pool and the sweeper.
    pub fn start_background_tasks(&self, jobs: UnboundedReceiver<DeliveryJob>) -> Vec<JoinHandle<()>> {
        let delivery = &self.config.delivery;
        let mut handles = federation::spawn_workers(self.scheduler.clone(), jobs, delivery.workers);
        handles.push(federation::spawn_sweeper(
            self.db.clone(),
            self.trigger.clone(),
            delivery.sweep_interval(),
            delivery.stale_running(),
        ));
        handles
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .merge(api::delivery_router())
        .merge(api::metrics_router())
        .route_layer(axum::middleware::from_fn(api::track_http_requests))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
