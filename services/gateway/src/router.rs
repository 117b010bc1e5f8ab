use crate::handlers::{health, history, streams, ws};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/history/{instrument}", get(history::get_history))
        .route("/streams", get(health::list_streams))
        .route(
            "/streams/force-start/{instrument}/{interval}",
            post(streams::force_start),
        )
        .route(
            "/streams/force-stop/{instrument}/{interval}",
            post(streams::force_stop),
        );

    Router::new()
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .route("/ws", get(ws::ws_handler))
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
