//! Call signaling types and messages
//!
//! Every message on the relay is a JSON object tagged by `type`:
//!
//! ```text
//! { "type": "ready",         "from": "u1" }
//! { "type": "offer",         "from": "u1", "sdp": "...", "timestamp": 1700000000000, "signature": "..." }
//! { "type": "answer",        "from": "u2", "sdp": "...", "timestamp": 1700000000000, "signature": "..." }
//! { "type": "ice_candidate", "from": "u1", "candidate": { "candidate": "...", "sdpMid": "0" }, ... }
//! { "type": "hangup",        "from": "u2" }
//! ```

use serde::{Deserialize, Serialize};

/// Signal exchanged between the two call peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Sender has subscribed and is listening
    Ready { from: String },
    /// SDP offer from the talker
    Offer {
        from: String,
        sdp: String,
        timestamp: i64,
        signature: String,
    },
    /// SDP answer from the listener
    Answer {
        from: String,
        sdp: String,
        timestamp: i64,
        signature: String,
    },
    /// Trickled ICE candidate
    IceCandidate {
        from: String,
        candidate: IceCandidate,
        timestamp: i64,
        signature: String,
    },
    /// Sender is leaving the call
    Hangup { from: String },
}

impl Signal {
    /// Sender user id
    pub fn from(&self) -> &str {
        match self {
            Signal::Ready { from }
            | Signal::Offer { from, .. }
            | Signal::Answer { from, .. }
            | Signal::IceCandidate { from, .. }
            | Signal::Hangup { from } => from,
        }
    }

    /// Wire name of the signal type
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Ready { .. } => "ready",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice_candidate",
            Signal::Hangup { .. } => "hangup",
        }
    }

    /// Timestamp and signature, for the signed variants
    pub fn stamp(&self) -> Option<(i64, &str)> {
        match self {
            Signal::Offer {
                timestamp,
                signature,
                ..
            }
            | Signal::Answer {
                timestamp,
                signature,
                ..
            }
            | Signal::IceCandidate {
                timestamp,
                signature,
                ..
            } => Some((*timestamp, signature.as_str())),
            Signal::Ready { .. } | Signal::Hangup { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Offer/answer state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the collaborator may decide to hang up
    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
