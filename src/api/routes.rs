//! API Routes
//!
//! Configures the Axum router with all gateway endpoints.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    health_handler, products_by_ids_handler, products_exists_handler, stats_handler,
    users_by_ids_handler, users_exists_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `POST /lookups/users/exists` - existence map for user ids
/// - `POST /lookups/users/by-ids` - user infos for ids
/// - `POST /lookups/products/exists` - existence map for product ids
/// - `POST /lookups/products/by-ids` - product infos for ids
/// - `GET /stats` - cache statistics
/// - `GET /health` - liveness and broker connection state
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let lookups = Router::new()
        .route("/users/exists", post(users_exists_handler))
        .route("/users/by-ids", post(users_by_ids_handler))
        .route("/products/exists", post(products_exists_handler))
        .route("/products/by-ids", post(products_by_ids_handler));

    Router::new()
        .nest("/lookups", lookups)
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
