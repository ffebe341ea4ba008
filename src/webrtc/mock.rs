//! In-memory transport for session tests
//!
//! Follows the offer/answer state rules of a real peer connection, records
//! every call, and reports `connected` once both descriptions are applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::config::RtcConfig;
use super::signaling::{
    ConnectionState, IceCandidate, SdpKind, SessionDescription, SignalingState,
};
use super::transport::{MediaTransport, TransportEvent, TransportEventSender, TransportFactory};
use crate::error::{AppError, Result};
use crate::media::LocalTrack;

struct MockInner {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    log: Vec<String>,
    applied: Vec<String>,
    offers_created: usize,
    close_calls: usize,
    tracks: Vec<String>,
}

pub(crate) struct MockTransport {
    label: String,
    events: TransportEventSender,
    offer_failures: AtomicUsize,
    inner: Mutex<MockInner>,
}

impl MockTransport {
    fn new(label: &str, events: TransportEventSender, offer_failures: usize) -> Self {
        Self {
            label: label.to_string(),
            events,
            offer_failures: AtomicUsize::new(offer_failures),
            inner: Mutex::new(MockInner {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                log: Vec::new(),
                applied: Vec::new(),
                offers_created: 0,
                close_calls: 0,
                tracks: Vec::new(),
            }),
        }
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn offers_created(&self) -> usize {
        self.inner.lock().offers_created
    }

    pub(crate) fn applied_candidates(&self) -> Vec<String> {
        self.inner.lock().applied.clone()
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.inner.lock().log.clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.inner.lock().close_calls
    }

    pub(crate) fn tracks(&self) -> Vec<String> {
        self.inner.lock().tracks.clone()
    }

    /// Move to `next`, emitting signaling and connection events
    fn transition(&self, next: SignalingState) {
        let connected = {
            let mut inner = self.inner.lock();
            inner.signaling = next;
            next == SignalingState::Stable && inner.local.is_some() && inner.remote.is_some()
        };
        self.emit(TransportEvent::SignalingState(next));
        if connected {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn add_track(&self, track: &Arc<LocalTrack>, _stream_id: &str) -> Result<()> {
        self.inner.lock().tracks.push(track.kind().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let remaining = self.offer_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.offer_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Negotiation("injected offer failure".to_string()));
        }
        let mut inner = self.inner.lock();
        inner.offers_created += 1;
        inner.log.push("create:offer".to_string());
        Ok(SessionDescription::offer(format!(
            "offer-from-{}-{}",
            self.label, inner.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock();
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(AppError::Negotiation(format!(
                "cannot answer in {}",
                inner.signaling
            )));
        }
        inner.log.push("create:answer".to_string());
        Ok(SessionDescription::answer(format!("answer-from-{}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let next = {
            let mut inner = self.inner.lock();
            let next = match (inner.signaling, desc.kind) {
                (SignalingState::Stable, SdpKind::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpKind::Answer) => SignalingState::Stable,
                (state, kind) => {
                    return Err(AppError::Negotiation(format!(
                        "local {:?} invalid in {}",
                        kind, state
                    )))
                }
            };
            inner.log.push(format!("local:{:?}", desc.kind).to_lowercase());
            inner.local = Some(desc);
            next
        };
        self.transition(next);
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
            "host-{}",
            self.label
        ))));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let next = {
            let mut inner = self.inner.lock();
            let next = match (inner.signaling, desc.kind) {
                (SignalingState::Stable, SdpKind::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpKind::Answer) => SignalingState::Stable,
                (state, kind) => {
                    return Err(AppError::Negotiation(format!(
                        "remote {:?} invalid in {}",
                        kind, state
                    )))
                }
            };
            inner.log.push(format!("remote:{:?}", desc.kind).to_lowercase());
            inner.remote = Some(desc);
            next
        };
        self.transition(next);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.remote.is_none() {
            return Err(AppError::Transport("no remote description".to_string()));
        }
        inner.log.push(format!("candidate:{}", candidate.candidate));
        inner.applied.push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    async fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.close_calls += 1;
            inner.signaling = SignalingState::Closed;
        }
        self.emit(TransportEvent::ConnectionState(ConnectionState::Closed));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    offer_failures: usize,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn failing_offers(count: usize) -> Self {
        Self {
            offer_failures: count,
            ..Self::default()
        }
    }

    pub(crate) fn last(&self) -> Arc<MockTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created")
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        _config: &RtcConfig,
        session_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaTransport>> {
        let transport = Arc::new(MockTransport::new(session_id, events, self.offer_failures));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}
