//! Control-plane wire messages
//!
//! Inbound commands are a closed tagged union keyed by `command`; anything
//! else is rejected as a bad request. Outbound messages are keyed by `type`.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::robot::RobotTarget;
use crate::webrtc::IceCandidate;

/// Command sent by the UI
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Connect to the robot, by bare LAN ip or full target
    Connect {
        #[serde(default)]
        ip: Option<String>,
        #[serde(default)]
        target: Option<RobotTarget>,
    },
    Disconnect,
    /// Turn forwarding of robot telemetry to this UI on or off
    Subscribe {
        switch: bool,
    },
    /// Start or renegotiate a viewer connection
    VideoOffer {
        #[serde(default)]
        connection_id: Option<String>,
        sdp: String,
    },
    /// Trickled candidate; never answered
    IceCandidate {
        connection_id: String,
        candidate: IceCandidate,
    },
    VideoClose {
        connection_id: String,
    },
}

impl ClientCommand {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| AppError::BadRequest(format!("Invalid command: {}", e)))
    }

    /// Commands that can wait on the robot link for up to the connect timeout
    pub fn is_robot_lifecycle(&self) -> bool {
        matches!(self, ClientCommand::Connect { .. } | ClientCommand::Disconnect)
    }
}

/// Message sent to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Robot connected or disconnected
    RobotState { connected: bool },
    /// One robot state report, forwarded while subscribed
    RobotTelemetry {
        topic: String,
        data: serde_json::Value,
    },
    /// Answer to a `video_offer`
    VideoAnswer { connection_id: String, sdp: String },
    /// Outcome of a command
    #[serde(rename = "result")]
    CommandResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Another UI client took over the control channel
    SessionReplaced,
}

impl ServerMessage {
    pub fn ok() -> Self {
        Self::CommandResult {
            ok: true,
            error: None,
        }
    }

    pub fn error(err: &AppError) -> Self {
        Self::CommandResult {
            ok: false,
            error: Some(err.to_string()),
        }
    }

    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::error(&e),
        }
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
