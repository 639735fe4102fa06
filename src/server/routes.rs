//! HTTP routes definition

use axum::{routing::get, Router};

use super::handlers;

/// Item CRUD
///
/// - GET    /api/items      - List all items
/// - POST   /api/items      - Create an item
/// - GET    /api/items/:id  - Get one item
/// - PUT    /api/items/:id  - Replace name and description
/// - DELETE /api/items/:id  - Delete an item
pub fn item_routes() -> Router {
    Router::new()
        .route(
            "/api/items",
            get(handlers::list_items)
                .post(handlers::create_item)
                .fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/items/:id",
            get(handlers::get_item)
                .put(handlers::update_item)
                .delete(handlers::delete_item)
                .fallback(handlers::method_not_allowed),
        )
}

/// Ephemeral display buffer
pub fn display_routes() -> Router {
    Router::new().route(
        "/api/display",
        get(handlers::get_display)
            .post(handlers::set_display)
            .fallback(handlers::method_not_allowed),
    )
}

/// Health, host details and metrics
pub fn health_routes() -> Router {
    Router::new()
        .route(
            "/health",
            get(handlers::health).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/system",
            get(handlers::system_info).fallback(handlers::method_not_allowed),
        )
        .route(
            "/metrics",
            get(handlers::metrics_handler).fallback(handlers::method_not_allowed),
        )
}
