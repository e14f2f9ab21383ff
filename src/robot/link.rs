//! Robot-link seam
//!
//! The bridge never speaks the robot's own protocol directly. A
//! [`RobotConnector`] turns a [`RobotTarget`] into a live [`RobotLink`],
//! which exposes exactly one upstream video [`MediaTrack`] and, when the
//! transport carries it, a stream of [`RobotTelemetry`] reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{AppError, Result};
use crate::video::MediaTrack;

/// Address of the robot on its own access point
pub const LOCAL_AP_ADDRESS: &str = "192.168.12.1";

/// How to reach the robot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RobotTarget {
    /// Bridge joined the robot's access point
    LocalAp,
    /// Robot and bridge on the same LAN
    LocalSta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        serial_number: Option<String>,
    },
    /// Through the vendor's remote service
    Remote {
        serial_number: String,
        username: String,
        password: String,
    },
}

impl Default for RobotTarget {
    fn default() -> Self {
        Self::LocalAp
    }
}

impl RobotTarget {
    /// LAN target for a robot at `ip`
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self::LocalSta {
            ip: Some(ip.into()),
            serial_number: None,
        }
    }

    /// Check the target carries what its method needs
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::LocalAp => Ok(()),
            Self::LocalSta { ip, serial_number } => {
                let has_ip = ip.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
                let has_serial = serial_number
                    .as_deref()
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false);
                if has_ip || has_serial {
                    Ok(())
                } else {
                    Err(AppError::Config(
                        "local_sta target needs an ip or a serial_number".to_string(),
                    ))
                }
            }
            Self::Remote {
                serial_number,
                username,
                password,
            } => {
                if serial_number.trim().is_empty()
                    || username.trim().is_empty()
                    || password.is_empty()
                {
                    Err(AppError::Config(
                        "remote target needs serial_number, username and password".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Direct network address of the robot, when the target names one
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::LocalAp => Some(LOCAL_AP_ADDRESS),
            Self::LocalSta { ip: Some(ip), .. } if !ip.trim().is_empty() => Some(ip.trim()),
            _ => None,
        }
    }

    /// Copy safe to show in status responses
    pub fn redacted(&self) -> Self {
        match self {
            Self::Remote {
                serial_number,
                username,
                ..
            } => Self::Remote {
                serial_number: serial_number.clone(),
                username: username.clone(),
                password: "********".to_string(),
            },
            other => other.clone(),
        }
    }
}

impl std::fmt::Display for RobotTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalAp => write!(f, "local_ap({})", LOCAL_AP_ADDRESS),
            Self::LocalSta {
                ip: Some(ip), ..
            } => write!(f, "local_sta({})", ip),
            Self::LocalSta {
                serial_number: Some(sn),
                ..
            } => write!(f, "local_sta(sn {})", sn),
            Self::LocalSta { .. } => write!(f, "local_sta(?)"),
            Self::Remote { serial_number, .. } => write!(f, "remote(sn {})", serial_number),
        }
    }
}

/// One state report published by the robot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotTelemetry {
    /// Robot-side topic the report was published on
    pub topic: String,
    pub data: serde_json::Value,
}

/// Establishes robot links
#[async_trait]
pub trait RobotConnector: Send + Sync {
    /// Open a link to `target`. The session bounds this with its timeout
    /// and drops the future on expiry, so a partial link must clean up on
    /// drop.
    async fn connect(&self, target: &RobotTarget) -> Result<Box<dyn RobotLink>>;
}

/// A live robot connection
#[async_trait]
pub trait RobotLink: Send + Sync {
    /// The robot's video track
    fn video_track(&self) -> Arc<dyn MediaTrack>;

    /// Whether the link is still up
    fn is_connected(&self) -> bool;

    /// Subscribe to the robot's state reports. `None` when the link
    /// carries video only.
    fn telemetry(&self) -> Option<broadcast::Receiver<RobotTelemetry>> {
        None
    }

    /// Close the link; the video track ends
    async fn disconnect(&self);
}
