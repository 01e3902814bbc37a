//! HTTP server implementation

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::checks::{evaluate_body, evaluate_headers, CheckRegistry, HealthReport, HealthSource};
use crate::error::HealthResult;

/// Path served by the endpoint, matched case-insensitively
pub const HEALTH_PATH: &str = "/health";

/// Header selecting header-mode checks
pub const HEALTH_HEADER: &str = "X-ERIGON-HEALTHCHECK";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Maximum request body size (default: 64KB)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 5555)),
            max_body_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with the given address
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}

struct ServerState {
    source: Arc<dyn HealthSource>,
    registry: CheckRegistry,
}

/// Health check HTTP server
pub struct HealthServer {
    config: ServerConfig,
    state: Arc<ServerState>,
}

impl HealthServer {
    /// Create a server over `source` with the default check registry
    pub fn new(config: ServerConfig, source: Arc<dyn HealthSource>) -> Self {
        Self::with_registry(config, source, CheckRegistry::default())
    }

    /// Create a server with a custom registry
    pub fn with_registry(
        config: ServerConfig,
        source: Arc<dyn HealthSource>,
        registry: CheckRegistry,
    ) -> Self {
        Self {
            config,
            state: Arc::new(ServerState { source, registry }),
        }
    }

    /// Build the router
    ///
    /// Every path goes through one handler so `/health` matches in any case.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_health)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(RequestBodyLimitLayer::new(self.config.max_body_size)),
            )
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> HealthResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!("Health server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Get the server listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen_addr
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn respond(report: HealthReport) -> Response {
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}

async fn handle_health(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !uri.path().eq_ignore_ascii_case(HEALTH_PATH) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let now = unix_now();
    let source = state.source.as_ref();

    let values: Vec<&str> = headers
        .get_all(HEALTH_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let report = if headers.contains_key(HEALTH_HEADER) {
        evaluate_headers(&state.registry, values, source, now).await
    } else {
        evaluate_body(&body, source, now).await
    };
    if !report.is_healthy() {
        tracing::debug!("Health check failed: {:?}", report);
    }
    respond(report)
}
