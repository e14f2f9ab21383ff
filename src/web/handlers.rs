use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::robot::{RobotStatus, RobotTarget};
use crate::state::AppState;
use crate::webrtc::{
    AnswerResponse, CloseRequest, IceCandidateRequest, IceServer, OfferRequest,
    RelayConnectionInfo,
};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SuccessResponse {
    fn with_message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

// ============================================================================
// Robot
// ============================================================================

pub async fn robot_status(State(state): State<Arc<AppState>>) -> Json<RobotStatus> {
    Json(state.robot.status())
}

/// Connect request: a bare LAN ip, a full target, or neither (configured target)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    pub ip: Option<String>,
    pub target: Option<RobotTarget>,
}

pub async fn robot_connect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<RobotStatus>> {
    let config = state.config.get();
    let target = match (req.target, req.ip) {
        (Some(target), _) => target,
        (None, Some(ip)) => RobotTarget::from_ip(ip),
        (None, None) => config.robot.target.clone(),
    };

    state
        .robot
        .connect(target, config.robot.connect_timeout())
        .await?;
    Ok(Json(state.robot.status()))
}

pub async fn robot_disconnect(State(state): State<Arc<AppState>>) -> Json<SuccessResponse> {
    state.robot.disconnect().await;
    SuccessResponse::with_message("Robot disconnected")
}

// ============================================================================
// WebRTC
// ============================================================================

pub async fn webrtc_offer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OfferRequest>,
) -> Result<Json<AnswerResponse>> {
    let connection_id = req
        .connection_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let sdp = state.relay.handle_offer(&connection_id, &req.sdp).await?;
    Ok(Json(AnswerResponse { sdp, connection_id }))
}

pub async fn webrtc_ice_candidate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IceCandidateRequest>,
) -> Json<SuccessResponse> {
    state
        .relay
        .add_ice_candidate(&req.connection_id, req.candidate)
        .await;
    Json(SuccessResponse {
        success: true,
        message: None,
    })
}

pub async fn webrtc_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloseRequest>,
) -> Json<SuccessResponse> {
    state.relay.close_connection(&req.connection_id).await;
    info!("Viewer closed relay connection {}", req.connection_id);
    SuccessResponse::with_message("Connection closed")
}

/// Relay status response
#[derive(Serialize)]
pub struct WebRtcStatus {
    pub has_upstream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_track: Option<String>,
    pub upstream_generation: u64,
    pub connection_count: usize,
    pub connections: Vec<RelayConnectionInfo>,
}

pub async fn webrtc_status(State(state): State<Arc<AppState>>) -> Json<WebRtcStatus> {
    let connections = state.relay.list_connections().await;
    Json(WebRtcStatus {
        has_upstream: state.relay.has_upstream(),
        upstream_track: state.relay.upstream_track_id(),
        upstream_generation: state.relay.upstream_generation(),
        connection_count: connections.len(),
        connections,
    })
}

/// ICE servers for the browser side
#[derive(Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

pub async fn webrtc_ice_servers(State(state): State<Arc<AppState>>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.get().webrtc.ice_servers(),
    })
}
