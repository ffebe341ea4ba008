use serde::{Deserialize, Serialize};

use crate::webrtc::{RtcConfig, SessionConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// ICE servers handed to every peer connection
    pub ice: RtcConfig,
    /// Call timing and capture constraints
    pub session: SessionConfig,
    /// Signal relay endpoints
    pub relay: RelayConfig,
}

/// Signal relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address for `talkline relay`
    pub bind: String,
    /// WebSocket URL clients connect to
    pub url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            url: "ws://127.0.0.1:8787/relay".to_string(),
        }
    }
}
