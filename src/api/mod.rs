pub mod handlers;
pub mod models;

use crate::app::App;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/streams", get(handlers::list_streams))
        .route("/stream/:name/webrtc", get(handlers::webrtc_ws))
        .with_state(app)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
