//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/auth/whoami", get(handlers::whoami))
        // Manifest registry
        .route(
            "/v1/manifests",
            post(handlers::create_manifest).get(handlers::list_manifests),
        )
        .route("/v1/manifests/{manifest_id}", get(handlers::get_manifest))
        .route(
            "/v1/manifests/{manifest_id}/publish",
            post(handlers::publish_manifest),
        )
        .route(
            "/v1/manifests/{manifest_id}/promote",
            post(handlers::promote_manifest),
        )
        // Rollouts
        .route(
            "/v1/manifests/{manifest_id}/rollout",
            post(handlers::rollout_manifest),
        )
        .route(
            "/v1/manifests/{manifest_id}/rollback",
            post(handlers::rollback_manifest),
        )
        .route(
            "/v1/manifests/{manifest_id}/complete",
            post(handlers::complete_manifest),
        )
        .route(
            "/v1/manifests/{manifest_id}/status",
            get(handlers::manifest_status),
        )
        .route(
            "/v1/gateways/{gateway_id}/updates",
            get(handlers::gateway_updates),
        )
        // Content-addressed artifacts (unauthenticated)
        .route(
            "/v1/artifacts/{content_hash}/{file}",
            get(handlers::get_artifact),
        )
        // Admin
        .route(
            "/v1/admin/tokens",
            post(handlers::create_token).get(handlers::list_tokens),
        )
        .route(
            "/v1/admin/tokens/{token_id}",
            delete(handlers::revoke_token),
        )
        .route(
            "/v1/admin/escalations",
            get(handlers::list_escalations),
        )
        .route(
            "/v1/admin/escalations/{escalation_id}/acknowledge",
            post(handlers::acknowledge_escalation),
        );

    // Gateway polling and reporting
    let gateway_routes = Router::new()
        .route("/updates/check", get(handlers::check_updates))
        .route("/updates/progress", post(handlers::report_progress))
        .route("/updates/success", post(handlers::report_success))
        .route("/updates/failure", post(handlers::report_failure))
        .route(
            "/v1/gateways/{gateway_id}/channel",
            get(handlers::gateway_channel),
        );

    let mut router = Router::new().merge(api_routes).merge(gateway_routes);

    // Unauthenticated; restrict at the network level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Order of execution: TraceLayer -> Auth -> Handler
    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
