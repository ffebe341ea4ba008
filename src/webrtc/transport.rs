//! Media transport seam
//!
//! The negotiation core drives a transport through this trait and learns about
//! asynchronous transport activity through [`TransportEvent`]s. SDP and
//! candidate blobs pass through untouched.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::config::RtcConfig;
use super::signaling::{ConnectionState, IceCandidate, SessionDescription, SignalingState};
use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};

/// Asynchronous transport activity
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// Peer connection state changed
    ConnectionState(ConnectionState),
    /// Offer/answer state changed (diagnostics only)
    SignalingState(SignalingState),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One peer-to-peer media session
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Attach a local track under `stream_id` and start sending its frames
    async fn add_track(&self, track: &Arc<LocalTrack>, stream_id: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<()>;
}

/// Creates transports for new calls
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &RtcConfig,
        session_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>>;
}
