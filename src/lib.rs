//! Fedipost - ActivityPub server-to-server federation for a small
//! micro-posting server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - WebFinger / NodeInfo                                     │
//! │  - Actors, inboxes, outboxes, collections, notes            │
//! │  - Admin endpoints                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Service Layer / Federation Engine               │
//! │  - Accounts, notes, follows                                 │
//! │  - Signatures, identity, dispatch, queue, relays, threads   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - FederationStore trait                                    │
//! │  - SQLite (sqlx) or in-memory                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `auth`: Admin bearer token
//! - `service`: Business logic layer
//! - `federation`: ActivityPub federation engine
//! - `data`: Persistence
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use data::FederationStore;
use federation::{
    ActivityDelivery, DeliveryQueue, IdentityResolver, InboxDispatcher, KeyPair, KeyRing,
    LocalUrls, OutboundProcessor, Publisher, QueueSettings, QueueWorker, RateLimiter,
    RelayManager, RemoteFetcher, SignatureVerifier, ThreadResolver,
};
use service::{AccountService, NoteService, SocialService};

/// Application state shared across all handlers
///
/// Every component receives the store explicitly; nothing reaches for a
/// global handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Persistence collaborator
    pub store: Arc<dyn FederationStore>,

    /// URL scheme of local objects
    pub urls: LocalUrls,

    /// Instance and per-user signing keys
    pub keys: Arc<KeyRing>,

    pub resolver: Arc<IdentityResolver>,
    pub verifier: Arc<SignatureVerifier>,
    pub queue: DeliveryQueue,
    pub publisher: Arc<Publisher>,
    pub dispatcher: Arc<InboxDispatcher>,
    pub relays: Arc<RelayManager>,
    pub threads: Arc<ThreadResolver>,
    pub worker: Arc<QueueWorker>,

    /// Inbound requests per remote domain
    pub rate_limiter: Arc<RateLimiter>,

    pub accounts: Arc<AccountService>,
    pub notes: Arc<NoteService>,
    pub social: Arc<SocialService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Open the store (SQLite file, or in-memory for `:memory:`)
    /// 2. Load or generate the instance actor key
    /// 3. Wire the federation components
    ///
    /// # Errors
    /// A missing or corrupt key file is a configuration error and is fatal
    /// for the binary.
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let store: Arc<dyn FederationStore> = if config.database.is_in_memory() {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Arc::new(data::MemoryStore::new())
        } else {
            Arc::new(data::SqliteStore::connect(&config.database.path).await?)
        };

        let key_path = config.federation.key_path.clone();
        let generate = config.federation.generate_missing_key;
        let bits = config.federation.rsa_key_bits;
        let instance_keys = tokio::task::spawn_blocking(move || {
            KeyPair::load_or_generate(&key_path, generate, bits)
        })
        .await
        .map_err(|e| error::AppError::Internal(e.into()))??;

        let state = Self::with_store(config, store, instance_keys)?;
        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Wire every component over an existing store and instance key
    ///
    /// Must be called inside a Tokio runtime: the outbound publisher spawns
    /// its workers here.
    pub fn with_store(
        config: config::AppConfig,
        store: Arc<dyn FederationStore>,
        instance_keys: KeyPair,
    ) -> Result<Self, error::AppError> {
        let federation = &config.federation;
        let urls = LocalUrls::new(&config.server.base_url(), &config.server.domain);

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Fedipost/", env!("CARGO_PKG_VERSION")))
            .timeout(federation.delivery_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let fetcher = RemoteFetcher::new(http_client, federation.allow_private_hosts);

        let keys = Arc::new(KeyRing::new(store.clone(), urls.clone(), instance_keys));
        let resolver = Arc::new(IdentityResolver::new(
            store.clone(),
            fetcher.clone(),
            keys.instance_signer().clone(),
            federation.actor_cache_ttl(),
        ));
        let verifier = Arc::new(SignatureVerifier::new(
            resolver.clone(),
            federation.signature_max_skew_secs,
        ));

        let queue = DeliveryQueue::new(store.clone());
        let relays = Arc::new(RelayManager::new(
            store.clone(),
            resolver.clone(),
            queue.clone(),
            urls.clone(),
        ));
        let worker = Arc::new(QueueWorker::new(
            store.clone(),
            ActivityDelivery::new(fetcher),
            keys.clone(),
            relays.clone(),
            QueueSettings {
                batch_size: federation.queue_batch_size,
                lease: federation.queue_lease(),
                concurrency: federation.delivery_concurrency,
            },
        ));

        let processor = Arc::new(OutboundProcessor::new(
            store.clone(),
            resolver.clone(),
            queue.clone(),
            urls.clone(),
        ));
        let publisher = Arc::new(Publisher::start(
            processor,
            federation.outbound_workers,
            federation.outbound_channel_capacity,
        ));

        let dispatcher = Arc::new(InboxDispatcher::new(
            store.clone(),
            resolver.clone(),
            queue.clone(),
            relays.clone(),
            urls.clone(),
        ));
        let threads = Arc::new(ThreadResolver::new(store.clone(), urls.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(federation.inbound_requests_per_second));

        let accounts = Arc::new(AccountService::new(store.clone(), federation.rsa_key_bits));
        let notes = Arc::new(NoteService::new(
            store.clone(),
            urls.clone(),
            publisher.clone(),
            federation.enabled,
        ));
        let social = Arc::new(SocialService::new(
            store.clone(),
            urls.clone(),
            resolver.clone(),
            publisher.clone(),
            federation.enabled,
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            urls,
            keys,
            resolver,
            verifier,
            queue,
            publisher,
            dispatcher,
            relays,
            threads,
            worker,
            rate_limiter,
            accounts,
            notes,
            social,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments. With federation disabled
/// the discovery and ActivityPub routes are not mounted and answer 404.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    let mut router = Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/admin", api::admin_router());

    if state.config.federation.enabled {
        router = router
            .merge(api::wellknown_router())
            .merge(api::activitypub_router(
                state.config.federation.max_inbound_body_bytes,
            ));
    } else {
        tracing::warn!("Federation is disabled; ActivityPub endpoints are not mounted");
    }

    router
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .merge(api::metrics_router())
        .with_state(state)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::data::MemoryStore;

    fn state_with(adjust: impl FnOnce(&mut config::AppConfig)) -> AppState {
        let mut config = config::test_config();
        adjust(&mut config);
        let keys = tokio_test::assert_ok!(KeyPair::generate(1024));
        tokio_test::assert_ok!(AppState::with_store(
            config,
            Arc::new(MemoryStore::new()),
            keys
        ))
    }

    async fn status_of(state: AppState, uri: &str) -> StatusCode {
        let response = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn health_is_always_mounted() {
        let state = state_with(|config| config.federation.enabled = false);
        assert_eq!(status_of(state, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn federation_routes_follow_the_switch() {
        let enabled = state_with(|_| {});
        assert_eq!(status_of(enabled, "/actor").await, StatusCode::OK);

        let disabled = state_with(|config| config.federation.enabled = false);
        assert_eq!(status_of(disabled.clone(), "/actor").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(disabled, "/.well-known/nodeinfo").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn admin_requires_a_token() {
        let state = state_with(|_| {});
        assert_eq!(status_of(state, "/admin/relays").await, StatusCode::UNAUTHORIZED);
    }
}
