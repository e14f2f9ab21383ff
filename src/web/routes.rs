use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::video_ws::video_ws_handler;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Robot lifecycle
        .route("/robot/status", get(handlers::robot_status))
        .route("/robot/connect", post(handlers::robot_connect))
        .route("/robot/disconnect", post(handlers::robot_disconnect))
        // WebRTC signaling
        .route("/webrtc/offer", post(handlers::webrtc_offer))
        .route("/webrtc/ice", post(handlers::webrtc_ice_candidate))
        .route("/webrtc/close", post(handlers::webrtc_close))
        .route("/webrtc/status", get(handlers::webrtc_status))
        .route("/webrtc/ice-servers", get(handlers::webrtc_ice_servers));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", any(ws_handler))
        .route("/ws/video", any(video_ws_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
