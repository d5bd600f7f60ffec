//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers::{self, REQUEST_ID_HEADER};
use crate::config::Config;
use crate::llm::{ProviderClient, StreamSource};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn StreamSource>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(source: Arc<dyn StreamSource>, config: Config) -> Self {
        Self {
            source,
            config: Arc::new(config),
        }
    }
}

/// Correlation ID assigned to every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors_origin = state
        .config
        .server
        .cors_allow_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok());
    let max_concurrent = state.config.server.max_concurrent_requests;

    let chat = match cors_origin {
        Some(_) => post(handlers::chat).options(handlers::preflight),
        None => post(handlers::chat),
    };

    let mut router = Router::new()
        .route("/api/chat", chat)
        .route("/health", get(handlers::health))
        .route("/providers", get(handlers::list_providers))
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id));

    if let Some(origin) = cors_origin {
        router = router.layer(middleware::map_response_with_state(
            origin,
            handlers::cors_headers,
        ));
    }
    if let Some(limit) = max_concurrent {
        router = router.layer(GlobalConcurrencyLimitLayer::new(limit));
    }

    router.layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let client = ProviderClient::from_config(&config)?;
    let state = AppState::new(Arc::new(client), config);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting chatrelay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}
