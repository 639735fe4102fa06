//! HTTP route handlers

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Extension, Json, Path},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::metrics::{self, DISPLAY_UPDATES, ITEMS_TOTAL};
use super::middleware::{client_ip, user_agent};
use crate::error::Error;
use crate::item::ItemInput;
use crate::server::AppState;

/// Environment variables echoed by `/api/system`
pub const SYSTEM_ENV_ALLOWLIST: &[&str] = &[
    "PORT",
    "DB_PATH",
    "HOSTNAME",
    "POD_NAME",
    "POD_NAMESPACE",
    "NODE_NAME",
    "CONTAINER_ID",
];

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn json_bytes(status: StatusCode, body: Bytes) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Map a repository error onto its status code. Storage details stay in the
/// log.
fn repository_error(e: Error) -> Response {
    match e {
        Error::InvalidArgument(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
        Error::NotFound(_) => error_response(StatusCode::NOT_FOUND, "not found"),
        other => {
            error!(error = %other, "Storage operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        }
    }
}

/// Run a repository call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(repository_error),
        Err(e) => {
            error!(error = %e, "Repository task failed");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error"))
        }
    }
}

fn parse_id(raw: &str) -> Result<i64, Response> {
    raw.parse::<i64>()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid id"))
}

fn parse_input(body: &[u8]) -> Result<ItemInput, Response> {
    serde_json::from_slice(body).map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid json"))
}

/// Liveness check
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// List every item
#[instrument(skip(state))]
pub async fn list_items(Extension(state): Extension<Arc<AppState>>) -> Response {
    let items = state.ctx.items().clone();
    match blocking(move || items.list()).await {
        Ok(items) => Json(items).into_response(),
        Err(resp) => resp,
    }
}

/// Create an item
#[instrument(skip(state, body))]
pub async fn create_item(Extension(state): Extension<Arc<AppState>>, body: Bytes) -> Response {
    let input = match parse_input(&body) {
        Ok(input) => input,
        Err(resp) => return resp,
    };

    let items = state.ctx.items().clone();
    match blocking(move || items.create(input)).await {
        Ok(item) => {
            ITEMS_TOTAL.inc();
            info!(id = item.id, "Item created");
            (StatusCode::CREATED, Json(item)).into_response()
        }
        Err(resp) => resp,
    }
}

/// Fetch one item
#[instrument(skip(state))]
pub async fn get_item(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let items = state.ctx.items().clone();
    match blocking(move || items.get(id)).await {
        Ok(item) => Json(item).into_response(),
        Err(resp) => resp,
    }
}

/// Replace an item's name and description
#[instrument(skip(state, body))]
pub async fn update_item(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let input = match parse_input(&body) {
        Ok(input) => input,
        Err(resp) => return resp,
    };

    let items = state.ctx.items().clone();
    match blocking(move || items.update(id, input)).await {
        Ok(item) => Json(item).into_response(),
        Err(resp) => resp,
    }
}

/// Delete an item
#[instrument(skip(state))]
pub async fn delete_item(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let items = state.ctx.items().clone();
    match blocking(move || items.delete(id)).await {
        Ok(removed) => {
            // A racing delete that lost reports success without a removal
            if removed {
                ITEMS_TOTAL.dec();
            }
            info!(id, removed, "Item deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(resp) => resp,
    }
}

/// Current display payload, byte for byte
pub async fn get_display(Extension(state): Extension<Arc<AppState>>) -> Response {
    json_bytes(StatusCode::OK, state.ctx.display().get())
}

/// Replace the display payload
pub async fn set_display(Extension(state): Extension<Arc<AppState>>, body: Bytes) -> Response {
    match state.ctx.display().set(body) {
        Ok(stored) => {
            DISPLAY_UPDATES.inc();
            json_bytes(StatusCode::CREATED, stored)
        }
        Err(e) => {
            warn!(error = %e, "Rejected display payload");
            error_response(StatusCode::BAD_REQUEST, "invalid json")
        }
    }
}

/// Host and request details
#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub ips: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub client_ip: String,
    pub user_agent: String,
}

/// Describe the host serving the request
pub async fn system_info(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let ips = tokio::task::spawn_blocking(local_ipv4_addresses)
        .await
        .unwrap_or_default();

    let hostname = sysinfo::System::host_name()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string());

    let environment = SYSTEM_ENV_ALLOWLIST
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect();

    let mut header_map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        header_map
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    Json(SystemInfo {
        hostname,
        ips,
        environment,
        client_ip: client_ip(&headers, peer.as_ref()),
        user_agent: user_agent(&headers),
        headers: header_map,
    })
    .into_response()
}

/// Non-loopback IPv4 addresses of every interface, sorted
fn local_ipv4_addresses() -> Vec<String> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut addrs: Vec<String> = networks
        .list()
        .values()
        .flat_map(|data| data.ip_networks().iter().map(|net| net.addr))
        .filter(|addr| matches!(addr, IpAddr::V4(v4) if !v4.is_loopback()))
        .map(|addr| addr.to_string())
        .collect();
    addrs.sort();
    addrs.dedup();
    addrs
}

/// Prometheus exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_metrics(),
    )
}

/// Known path, unsupported method
pub async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}
