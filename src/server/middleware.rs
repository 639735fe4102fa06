//! HTTP middleware

use axum::{
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

use super::metrics;

/// Log and measure every request.
///
/// Emits one `request` event per call and feeds the request counter and
/// latency histogram.
pub async fn track_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client_ip = client_ip(req.headers(), req.extensions().get::<ConnectInfo<SocketAddr>>());
    let user_agent = user_agent(req.headers());

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let elapsed = start.elapsed();
    metrics::observe_request(method.as_str(), normalize_path(&path), status, elapsed.as_secs_f64());

    info!(
        method = %method,
        path = %path,
        status,
        latency_ms = elapsed.as_secs_f64() * 1000.0,
        client_ip = %client_ip,
        user_agent = %user_agent,
        "request"
    );

    response
}

/// Paths recorded verbatim as metric labels
const ROUTED_PATHS: &[&str] = &["/health", "/metrics", "/api/items", "/api/display", "/api/system"];

/// Label used for every path outside the route table
pub const OTHER_PATH: &str = "other";

/// Map a request path onto the bounded label set: known routes as-is,
/// per-item paths as `/api/items/:id`, anything else as `other`
pub fn normalize_path(path: &str) -> &'static str {
    if let Some(known) = ROUTED_PATHS.iter().find(|known| **known == path) {
        return known;
    }
    match path.strip_prefix("/api/items/") {
        Some(rest) if !rest.is_empty() && !rest.contains('/') => "/api/items/:id",
        _ => OTHER_PATH,
    }
}

/// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer
pub fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/items/42"), "/api/items/:id");
        assert_eq!(normalize_path("/api/items/abc"), "/api/items/:id");
        assert_eq!(normalize_path("/api/items"), "/api/items");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/api/display"), "/api/display");
    }

    #[test]
    fn test_unrouted_paths_share_one_label() {
        assert_eq!(normalize_path("/api/items/"), OTHER_PATH);
        assert_eq!(normalize_path("/api/items/1/extra"), OTHER_PATH);
        assert_eq!(normalize_path("/nope/123"), OTHER_PATH);
        assert_eq!(normalize_path("/favicon.ico"), OTHER_PATH);
        assert_eq!(normalize_path(""), OTHER_PATH);
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer = ConnectInfo("10.1.2.3:5555".parse::<SocketAddr>().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(&peer)), "10.1.2.3");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("192.168.0.9"));
        assert_eq!(client_ip(&headers, Some(&peer)), "192.168.0.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&headers, Some(&peer)), "203.0.113.7");
    }
}
