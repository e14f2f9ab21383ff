//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// Public STUN server used when nothing else is configured
pub const PUBLIC_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// WebRTC configuration for viewer-facing peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![PUBLIC_STUN_SERVER.to_string()],
            turn_servers: vec![],
        }
    }
}

impl WebRtcConfig {
    /// Whether at least one traversal server is configured
    pub fn has_ice_servers(&self) -> bool {
        self.stun_servers.iter().any(|s| !s.trim().is_empty()) || !self.turn_servers.is_empty()
    }

    /// ICE servers handed to every new peer connection.
    ///
    /// Always contains at least one entry: the public STUN server is
    /// used when the configuration lists none.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        servers.extend(self.turn_servers.iter().map(|turn| IceServer {
            urls: turn.urls.clone(),
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        }));

        if servers.is_empty() {
            servers.push(IceServer {
                urls: vec![PUBLIC_STUN_SERVER.to_string()],
                username: None,
                credential: None,
            });
        }
        servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Resolved ICE server entry (also served to browsers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
