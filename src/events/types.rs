//! Call event types

use std::sync::Arc;

use crate::error::AppError;
use crate::media::RemoteStream;
use crate::webrtc::signaling::ConnectionState;

/// Which side ended the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupInitiator {
    Local,
    Remote,
}

/// Notifications emitted by a call session
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Transport connection state changed
    ConnectionStateChanged(ConnectionState),
    /// Remote stream composition changed
    RemoteStream(RemoteStream),
    /// Media or negotiation failure
    Error(Arc<AppError>),
    /// Call ended. Emitted at most once per session.
    HungUp { initiator: HangupInitiator },
}

impl CallEvent {
    /// Event name for logging
    pub fn event_name(&self) -> &'static str {
        match self {
            CallEvent::ConnectionStateChanged(_) => "call.connection_state",
            CallEvent::RemoteStream(_) => "call.remote_stream",
            CallEvent::Error(_) => "call.error",
            CallEvent::HungUp { .. } => "call.hung_up",
        }
    }
}
