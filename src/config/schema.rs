use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::robot::RobotTarget;
use crate::video::VideoCodec;
pub use crate::webrtc::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Robot link settings
    pub robot: RobotConfig,
    /// Push-socket (JPEG) settings
    pub stream: StreamConfig,
    /// Viewer peer-connection settings
    pub webrtc: WebRtcConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Robot link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Target used when a connect command names none
    pub target: RobotTarget,
    pub connect_timeout_secs: u64,
    /// UDP address the robot's RTP stream is received on
    pub ingest_listen: String,
    /// Codec the robot sends
    pub codec: VideoCodec,
    /// Silence after which the link counts as lost
    pub idle_timeout_secs: u64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            target: RobotTarget::LocalAp,
            connect_timeout_secs: 5,
            ingest_listen: "0.0.0.0:5004".to_string(),
            codec: VideoCodec::H264,
            idle_timeout_secs: 5,
        }
    }
}

impl RobotConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        self.ingest_listen.parse().map_err(|_| {
            AppError::Config(format!("Invalid ingest_listen address: {}", self.ingest_listen))
        })
    }
}

/// Push-socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// How long a push socket waits for a new frame before re-checking
    pub push_wait_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            push_wait_ms: 1000,
        }
    }
}

impl StreamConfig {
    pub fn push_wait(&self) -> Duration {
        Duration::from_millis(self.push_wait_ms.max(10))
    }

    pub fn quality(&self) -> u32 {
        self.jpeg_quality.clamp(1, 100) as u32
    }
}
