use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, put};
use axum::Router;
use stock_bridge::{ListenerMonitor, StreamSessions};
use stock_store::ProductStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    /// Lifetime bound for each quantity stream; `None` streams indefinitely.
    pub stream_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            cors_origin: "http://localhost:8081".into(),
            stream_timeout: None,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProductStore>,
    pub sessions: StreamSessions,
    /// Notification listener liveness and counters.
    pub listener: ListenerMonitor,
    pub stream_timeout: Option<Duration>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, cors_origin: &str) -> Result<Router, ServerError> {
    let origin = HeaderValue::from_str(cors_origin)
        .map_err(|_| ServerError::InvalidCorsOrigin(cors_origin.to_string()))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    Ok(Router::new()
        .route("/api/v1/products", get(handlers::list_products))
        .route(
            "/api/v1/products/listen-product-quantity-updated",
            get(handlers::listen_product_quantity_updated),
        )
        .route("/api/v1/products/{ean}", put(handlers::update_quantity))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

/// Bind and serve. Returns once the socket is listening.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn ProductStore>,
    sessions: StreamSessions,
    listener: ListenerMonitor,
) -> Result<ServerHandle, ServerError> {
    let state = AppState {
        store,
        sessions,
        listener,
        stream_timeout: config.stream_timeout,
    };
    let router = build_router(state, &config.cors_origin)?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr, source })?;

    tracing::info!(addr = %local_addr, cors_origin = %config.cors_origin, "stock server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "server terminated with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        shutdown,
        task,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for open requests to finish.
    ///
    /// Streams stay open until their sessions end, so stop the listener first.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "server task did not exit cleanly");
        }
        tracing::info!("stock server stopped");
    }
}
