//! WebRTC peer connection transport

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::RtcConfig;
use super::signaling::{
    ConnectionState, IceCandidate, SdpKind, SessionDescription, SignalingState,
};
use super::transport::{MediaTransport, TransportEvent, TransportEventSender, TransportFactory};
use crate::error::{AppError, Result};
use crate::media::{pump_frames, FrameSink, LocalTrack, MediaFrame, RemoteTrack, TrackKind};

/// Peer connection wrapper reporting activity as [`TransportEvent`]s
pub struct RtcTransport {
    /// Session ID
    session_id: String,
    /// WebRTC peer connection
    pc: Arc<RTCPeerConnection>,
    /// Local tracks attached to the connection
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    /// One frame writer per local track
    writers: Mutex<Vec<JoinHandle<u64>>>,
}

impl RtcTransport {
    /// Create a new peer connection
    pub async fn new(
        config: &RtcConfig,
        session_id: String,
        events: TransportEventSender,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::Transport(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ..Default::default()
        };
        info!(
            "Creating peer connection for {} ({} ICE servers, turn: {})",
            session_id,
            rtc_config.ice_servers.len(),
            config.has_turn()
        );

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::Transport(format!("Failed to create peer connection: {}", e))
        })?;

        let transport = Self {
            session_id,
            pc: Arc::new(pc),
            local_tracks: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        };
        transport.setup_event_handlers(events);

        Ok(transport)
    }

    /// Forward peer connection callbacks to the event channel
    fn setup_event_handlers(&self, events: TransportEventSender) {
        let session_id = self.session_id.clone();
        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = new_state {
                    info!("Peer {} connection state: {}", session_id, state);
                    let _ = tx.send(TransportEvent::ConnectionState(state));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // None marks the end of gathering
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    debug!("Local ICE candidate: {}", init.candidate);
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                }
                Box::pin(async {})
            },
        ));

        let session_id = self.session_id.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                debug!("Peer {} signaling state: {}", session_id, s);
                if let Some(state) = map_signaling_state(s) {
                    let _ = events.send(TransportEvent::SignalingState(state));
                }
                Box::pin(async {})
            }));
    }

    /// Get session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        _ => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
}

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_track(&self, track: &Arc<LocalTrack>, stream_id: &str) -> Result<()> {
        let rtp_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(track.kind()),
            track.id().to_string(),
            stream_id.to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to add {} track: {}", track.kind(), e)))?;

        self.local_tracks.lock().push(rtp_track.clone());
        if track.frame_source().is_some() {
            let writer = tokio::spawn(pump_frames(track.clone(), rtp_track));
            self.writers.lock().push(writer);
        }
        debug!("{} track {} added to peer {}", track.kind(), track.id(), self.session_id);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state()).unwrap_or(SignalingState::Stable)
    }

    async fn close(&self) -> Result<()> {
        // Writers end on their own once tracks stop; abort any that are mid-write
        for writer in self.writers.lock().drain(..) {
            writer.abort();
        }
        self.local_tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to close peer connection: {}", e)))
    }
}

#[async_trait]
impl FrameSink for TrackLocalStaticSample {
    async fn write_frame(&self, frame: &MediaFrame) -> Result<()> {
        let sample = Sample {
            data: frame.data.clone(),
            duration: frame.duration,
            ..Default::default()
        };
        self.write_sample(&sample)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to write sample: {}", e)))
    }
}

/// Factory producing [`RtcTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &RtcConfig,
        session_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>> {
        let transport = RtcTransport::new(config, session_id.to_string(), events).await?;
        Ok(Arc::new(transport))
    }
}
