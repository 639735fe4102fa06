//! HTTP front for the item store
//!
//! Thin axum layer translating requests into repository and display-buffer
//! calls. Storage work runs on the blocking pool.

pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;

use axum::{extract::Extension, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::context::AppContext;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP port
    pub http_port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0".to_string(),
            http_port: 8080,
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_addr, self.http_port)
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>, config: ServerConfig) -> Self {
        Self { ctx, config }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("mode", self.ctx.store().mode())
            .finish()
    }
}

/// Assemble the full router with its layers
pub fn build_router(state: AppState) -> Router {
    metrics::init_metrics();
    match state.ctx.items().count() {
        Ok(count) => metrics::ITEMS_TOTAL.set(count as i64),
        Err(e) => warn!(error = %e, "Could not seed item gauge"),
    }

    let enable_cors = state.config.enable_cors;
    let app = Router::new()
        .merge(routes::item_routes())
        .merge(routes::display_routes())
        .merge(routes::health_routes())
        .layer(axum::middleware::from_fn(middleware::track_requests))
        .layer(Extension(Arc::new(state)))
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn start_server<F>(
    config: ServerConfig,
    ctx: Arc<AppContext>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        addr = %config.http_addr,
        port = config.http_port,
        mode = %ctx.store().mode(),
        "Starting itemkv HTTP server"
    );

    let addr = config.bind_addr();
    let app = build_router(AppState::new(ctx, config));
    let listener = TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| {
        error!(error = %e, "Server error");
        anyhow::anyhow!("Server failed: {}", e)
    })?;

    info!("HTTP server stopped");
    Ok(())
}
