//! WebRTC configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// WebRTC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_server: Option<TurnServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_server: None,
        }
    }
}

impl RtcConfig {
    /// Set TURN from the three loose values the deployment provides.
    ///
    /// A missing URL disables TURN; missing username or credential become empty.
    pub fn with_turn(
        mut self,
        url: Option<String>,
        username: Option<String>,
        credential: Option<String>,
    ) -> Self {
        self.turn_server = url.filter(|u| !u.trim().is_empty()).map(|url| {
            TurnServer::new(url, username.unwrap_or_default(), credential.unwrap_or_default())
        });
        self
    }

    pub fn has_turn(&self) -> bool {
        self.turn_server.is_some()
    }

    /// Build the ICE server list handed to the peer connection
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        if let Some(turn) = &self.turn_server {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
