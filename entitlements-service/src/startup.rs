//! Application startup and lifecycle management.

use crate::config::EntitlementsConfig;
use crate::handlers;
use crate::services::{
    init_metrics, BillingStore, BillingWebhookProcessor, ChatGateway, ChatProvider, Database,
    EntitlementsCache, EntitlementsResolver, GeminiChatProvider, MemoryStore, MockChatProvider,
    StripeClient, SubscriptionLookup,
};
use axum::{
    extract::Request,
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EntitlementsConfig>,
    pub store: Arc<dyn BillingStore>,
    pub resolver: Arc<EntitlementsResolver>,
    pub webhooks: Arc<BillingWebhookProcessor>,
    pub chat: Arc<ChatGateway>,
}

impl AppState {
    /// Wire the services together over an already-chosen store.
    pub fn new(
        config: EntitlementsConfig,
        store: Arc<dyn BillingStore>,
        stripe: Option<Arc<dyn SubscriptionLookup>>,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        let demo = config.mode.is_demo();
        let cache = Arc::new(EntitlementsCache::new(config.entitlements.cache_ttl));
        let resolver = Arc::new(EntitlementsResolver::new(
            store.clone(),
            stripe.clone(),
            config.stripe.prices.clone(),
            demo.then(|| config.demo.clone()),
            config.entitlements.grace_period(),
            cache,
        ));
        let webhooks = Arc::new(BillingWebhookProcessor::new(
            store.clone(),
            resolver.clone(),
            stripe,
            config.stripe.prices.clone(),
            config.stripe.webhook_secret.clone(),
            config.stripe.webhook_tolerance_secs,
        ));
        let chat = Arc::new(ChatGateway::new(
            store.clone(),
            resolver.clone(),
            provider,
            demo,
        ));

        Self {
            config: Arc::new(config),
            store,
            resolver,
            webhooks,
            chat,
        }
    }
}

/// HTTP routes with the shared middleware stack.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/entitlements", get(handlers::get_entitlements))
        .route("/entitlements/refresh", post(handlers::refresh_entitlements))
        .route("/usage", get(handlers::get_usage))
        .route("/billing/audit-log", get(handlers::list_audit_log))
        .route("/chat", post(handlers::chat))
        .route("/webhooks/stripe", post(handlers::stripe_webhook))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    tenant_id = tracing::field::Empty,
                )
            }),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn open_store(config: &EntitlementsConfig) -> Result<Arc<dyn BillingStore>, AppError> {
    match &config.database {
        Some(database) => {
            let db = Database::new(
                database.url.expose_secret(),
                database.max_connections,
                database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
            let store: Arc<dyn BillingStore> = Arc::new(db);
            Ok(store)
        }
        None if config.mode.is_demo() => {
            tracing::warn!("No DATABASE_URL in demo mode, billing data is kept in memory");
            let store: Arc<dyn BillingStore> = Arc::new(MemoryStore::new());
            Ok(store)
        }
        None => Err(AppError::ConfigError(anyhow::anyhow!(
            "DATABASE_URL is required in {} mode",
            config.mode
        ))),
    }
}

fn stripe_client(
    config: &EntitlementsConfig,
) -> Result<Option<Arc<dyn SubscriptionLookup>>, AppError> {
    let Some(secret_key) = config.stripe.secret_key.clone() else {
        tracing::info!("Stripe secret key not set, subscription lookups disabled");
        return Ok(None);
    };
    let client = StripeClient::new(secret_key, config.stripe.api_base_url.clone())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
    let client: Arc<dyn SubscriptionLookup> = Arc::new(client);
    Ok(Some(client))
}

fn chat_provider(config: &EntitlementsConfig) -> Result<Arc<dyn ChatProvider>, AppError> {
    match config.ai.gemini_api_key.clone() {
        Some(api_key) => {
            let provider = GeminiChatProvider::new(api_key, &config.ai)
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
            let provider: Arc<dyn ChatProvider> = Arc::new(provider);
            Ok(provider)
        }
        None => {
            tracing::warn!("GEMINI_API_KEY not set, using the mock chat provider");
            let provider: Arc<dyn ChatProvider> = Arc::new(MockChatProvider::new());
            Ok(provider)
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: EntitlementsConfig) -> Result<Self, AppError> {
        init_metrics();

        let store = open_store(&config).await?;
        let stripe = stripe_client(&config)?;
        let provider = chat_provider(&config)?;
        Self::build_with(config, store, stripe, provider).await
    }

    /// Build over caller-supplied collaborators. Tests use this to swap in
    /// fakes for Stripe or the chat provider.
    pub async fn build_with(
        config: EntitlementsConfig,
        store: Arc<dyn BillingStore>,
        stripe: Option<Arc<dyn SubscriptionLookup>>,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port = port,
            mode = %config.mode,
            stripe_enabled = config.stripe_enabled(),
            chat_provider = provider.name(),
            "Entitlements service listener bound"
        );

        let state = AppState::new(config, store, stripe, provider);
        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sweeper = self
            .state
            .resolver
            .cache()
            .clone()
            .spawn_sweeper(self.state.config.entitlements.cache_sweep_interval);

        tracing::info!(
            service = %self.state.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router(self.state)).await;
        sweeper.abort();

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
