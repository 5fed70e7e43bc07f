//! Top-level axum router: wires every route module and the shared
//! middleware stack (tracing, CORS, metrics, bearer auth).

use axum::http::HeaderValue;
use axum::middleware as axum_middleware;
use axum::routing::get;
use axum::Router;
use phx_telemetry::middleware::metrics_middleware;
use phx_telemetry::tracing_setup::request_id_middleware;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::AuthLayer;
use crate::routes;
use crate::state::AppState;
use crate::ws::ws_handler;

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.gateway.allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins = state
            .config
            .gateway
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect::<Vec<HeaderValue>>();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let agent_routes = routes::agents::router();

    let protected_api = Router::new()
        .merge(routes::experiments::router())
        .merge(routes::deployments::router())
        .merge(routes::pipelines::router())
        .merge(routes::loadsim::router())
        .merge(routes::auth::protected_router())
        .layer(AuthLayer::new(state.auth.clone()));

    let public_api = routes::auth::public_router();

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .nest("/api", public_api.merge(protected_api))
        .merge(agent_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
