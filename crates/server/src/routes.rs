//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Published registries index
        .route("/registries", get(handlers::get_registries))
        // Resource read path (GET and HEAD)
        .route(
            "/registry/{uuid}/{hash}",
            get(handlers::get_registry_resource),
        )
        .route(
            "/package/{uuid}/{hash}",
            get(handlers::get_package_resource),
        )
        .route("/artifact/{hash}", get(handlers::get_artifact))
        // Health check (intentionally unauthenticated for probes)
        .route("/healthz", get(handlers::health_check))
        // Operator retry knob
        .route("/admin/forget-failures", post(handlers::forget_failures));

    // SECURITY: when enabled, /metrics should be network-restricted to
    // authorized Prometheus scraper IPs at the infrastructure level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
