//! Call session
//!
//! One session runs as a single tokio task that owns the transport, the local
//! stream, the relay subscription and the negotiation state. Relay signals,
//! transport events and handle commands are processed one at a time, and every
//! handler re-checks the current state on entry instead of trusting what was
//! true when the input was produced.
//!
//! ```text
//!  CallHandle --commands--> SessionActor <--signals-- SignalChannel("call:<id>")
//!      ^                        |   ^
//!      |   watch / EventBus     |   +--TransportEvent-- MediaTransport
//!      +------------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::RtcConfig;
use super::guard::{SignatureGuard, DEFAULT_MAX_AGE_MS};
use super::negotiation::{NegotiationState, Phase, Role, Transition};
use super::signaling::{
    ConnectionState, IceCandidate, SessionDescription, Signal, SignalingState,
};
use super::transport::{MediaTransport, TransportEvent, TransportFactory};
use crate::error::{AppError, Result};
use crate::events::{CallEvent, EventBus, HangupInitiator};
use crate::media::{LocalStream, MediaConstraints, MediaSource, RemoteStream};
use crate::relay::{call_topic, SignalChannel, SignalRelay};

/// Who is calling whom, for one call attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIdentity {
    pub request_id: String,
    pub local_user_id: String,
    pub remote_user_id: String,
    pub role: Role,
}

impl CallIdentity {
    pub fn new(
        request_id: impl Into<String>,
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            local_user_id: local_user_id.into(),
            remote_user_id: remote_user_id.into(),
            role,
        }
    }

    pub fn topic(&self) -> String {
        call_topic(&self.request_id)
    }
}

/// Session timing and capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Freshness window for signed signals
    pub max_signal_age_ms: i64,
    /// Pause between announcing a hangup and tearing down
    pub hangup_grace_ms: u64,
    /// Upper bound on publishing the hangup signal
    pub publish_timeout_ms: u64,
    /// How long a failed/disconnected transport is observed before hanging up
    pub failure_hangup_delay_ms: u64,
    /// Capture constraints
    pub media: MediaConstraints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_signal_age_ms: DEFAULT_MAX_AGE_MS,
            hangup_grace_ms: 100,
            publish_timeout_ms: 1000,
            failure_hangup_delay_ms: 2000,
            media: MediaConstraints::default(),
        }
    }
}

impl SessionConfig {
    pub fn hangup_grace(&self) -> Duration {
        Duration::from_millis(self.hangup_grace_ms.min(150))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn failure_hangup_delay(&self) -> Duration {
        Duration::from_millis(self.failure_hangup_delay_ms)
    }
}

enum Command {
    /// Announce, then tear down
    Hangup(oneshot::Sender<()>),
    /// Tear down without announcing
    Close(oneshot::Sender<()>),
}

impl Command {
    fn complete(self) {
        match self {
            Command::Hangup(done) | Command::Close(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Local,
    Remote,
    Cancelled,
}

/// A call that has not started yet
pub struct CallSession {
    identity: CallIdentity,
    config: SessionConfig,
    rtc: RtcConfig,
    relay: Arc<dyn SignalRelay>,
    transports: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaSource>,
    events: Arc<EventBus>,
}

impl CallSession {
    pub fn new(
        identity: CallIdentity,
        relay: Arc<dyn SignalRelay>,
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        Self {
            identity,
            config: SessionConfig::default(),
            rtc: RtcConfig::default(),
            relay,
            transports,
            media,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rtc_config(mut self, rtc: RtcConfig) -> Self {
        self.rtc = rtc;
        self
    }

    /// Subscribe to events before starting, to observe startup failures
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Acquire media, create the transport, subscribe to the call topic and
    /// hand the call to its session task.
    ///
    /// A media failure is reported on the event bus and returned; the relay is
    /// never subscribed in that case.
    pub async fn start(self) -> Result<CallHandle> {
        let CallSession {
            identity,
            config,
            rtc,
            relay,
            transports,
            media,
            events,
        } = self;
        let session_id = format!("{}/{}", identity.request_id, identity.local_user_id);

        info!(
            "Starting call {} as {} ({} -> {})",
            identity.request_id, identity.role, identity.local_user_id, identity.remote_user_id
        );

        let local_stream = match media.acquire(&config.media).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Media acquisition failed for {}: {}", session_id, e);
                events.publish(CallEvent::Error(Arc::new(AppError::Media(e.clone()))));
                return Err(AppError::Media(e));
            }
        };

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = match transports.create(&rtc, &session_id, transport_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                local_stream.stop_all();
                return Err(e);
            }
        };

        for track in local_stream.tracks() {
            if let Err(e) = transport.add_track(track, local_stream.id()).await {
                local_stream.stop_all();
                let _ = transport.close().await;
                return Err(e);
            }
        }

        let channel = match SignalChannel::open(relay, &identity.request_id).await {
            Ok(channel) => channel,
            Err(e) => {
                local_stream.stop_all();
                let _ = transport.close().await;
                return Err(e);
            }
        };

        let (connection_tx, connection_rx) = watch::channel(ConnectionState::New);
        let (remote_tx, remote_rx) = watch::channel(None);
        let (signaling_tx, signaling_rx) = watch::channel(transport.signaling_state());
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle { peer_ready: false });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let actor = SessionActor {
            guard: SignatureGuard::new(identity.request_id.clone(), config.max_signal_age_ms),
            state: NegotiationState::new(identity.role),
            identity: identity.clone(),
            session_id,
            config: config.clone(),
            transport,
            transport_events: transport_rx,
            transport_open: true,
            channel,
            relay_open: true,
            local_stream: local_stream.clone(),
            remote_stream: RemoteStream::default(),
            commands: command_rx,
            cancelled: cancelled.clone(),
            cleaned_up: false,
            events: events.clone(),
            connection_tx,
            remote_tx,
            signaling_tx,
            phase_tx,
        };
        tokio::spawn(actor.run());

        Ok(CallHandle {
            inner: Arc::new(HandleInner {
                identity,
                config,
                commands: command_tx,
                cancelled,
                local_stream,
                events,
                connection_rx,
                remote_rx,
                signaling_rx,
                phase_rx,
            }),
        })
    }
}

struct SessionActor {
    identity: CallIdentity,
    session_id: String,
    config: SessionConfig,
    guard: SignatureGuard,
    state: NegotiationState,
    transport: Arc<dyn MediaTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_open: bool,
    channel: SignalChannel,
    relay_open: bool,
    local_stream: LocalStream,
    remote_stream: RemoteStream,
    commands: mpsc::UnboundedReceiver<Command>,
    cancelled: Arc<AtomicBool>,
    cleaned_up: bool,
    events: Arc<EventBus>,
    connection_tx: watch::Sender<ConnectionState>,
    remote_tx: watch::Sender<Option<RemoteStream>>,
    signaling_tx: watch::Sender<SignalingState>,
    phase_tx: watch::Sender<Phase>,
}

impl SessionActor {
    async fn run(mut self) {
        // The subscription is active by the time the task starts
        if !self.is_finished() {
            self.apply(Transition::LocalReady);
            self.announce_ready().await;
            self.maybe_offer("subscribed").await;
        }

        while !self.cleaned_up {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Hangup(done)) => {
                        self.teardown(Teardown::Local).await;
                        let _ = done.send(());
                    }
                    Some(Command::Close(done)) => {
                        self.teardown(Teardown::Cancelled).await;
                        let _ = done.send(());
                    }
                    None => self.teardown(Teardown::Cancelled).await,
                },

                signal = self.channel.recv(), if self.relay_open => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        warn!("Relay ended subscription for {}", self.channel.topic());
                        self.relay_open = false;
                    }
                },

                event = self.transport_events.recv(), if self.transport_open => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => self.transport_open = false,
                },
            }
        }

        // Commands queued behind the teardown have nothing left to do
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.complete();
        }
        debug!("Call session {} finished", self.session_id);
    }

    fn is_finished(&self) -> bool {
        self.cleaned_up || self.cancelled.load(Ordering::Acquire)
    }

    fn apply(&mut self, transition: Transition) -> bool {
        let from = self.state.phase();
        let changed = self.state.apply(transition);
        if changed {
            debug!(
                "Call {} phase {} -> {} ({:?})",
                self.session_id,
                from,
                self.state.phase(),
                transition
            );
            self.phase_tx.send_replace(self.state.phase());
        }
        changed
    }

    fn report(&self, error: AppError) {
        warn!(
            kind = error.kind(),
            "Call {} error: {}", self.session_id, error
        );
        self.events.publish(CallEvent::Error(Arc::new(error)));
    }

    async fn announce_ready(&self) {
        let ready = Signal::Ready {
            from: self.identity.local_user_id.clone(),
        };
        if let Err(e) = self.channel.send(&ready).await {
            warn!("Failed to announce readiness on {}: {}", self.channel.topic(), e);
        }
    }

    /// Offer trigger, evaluated when subscribed and when the peer's Ready arrives
    async fn maybe_offer(&mut self, trigger: &str) {
        if self.is_finished() || !self.state.should_offer(self.transport.signaling_state()) {
            return;
        }

        self.apply(Transition::OfferStarted);
        info!("Call {} creating offer ({})", self.session_id, trigger);

        if let Err(e) = self.send_offer().await {
            self.apply(Transition::OfferFailed);
            self.report(e);
        }
    }

    async fn send_offer(&self) -> Result<()> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;

        let (timestamp, signature) = self.guard.stamp(&self.identity.local_user_id);
        self.channel
            .send(&Signal::Offer {
                from: self.identity.local_user_id.clone(),
                sdp: offer.sdp,
                timestamp,
                signature,
            })
            .await
    }

    async fn send_answer(&self) -> Result<()> {
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;

        let (timestamp, signature) = self.guard.stamp(&self.identity.local_user_id);
        self.channel
            .send(&Signal::Answer {
                from: self.identity.local_user_id.clone(),
                sdp: answer.sdp,
                timestamp,
                signature,
            })
            .await
    }

    /// Whether a relay signal should be processed at all
    fn accepts(&self, signal: &Signal) -> bool {
        let from = signal.from();
        if from == self.identity.local_user_id {
            return false;
        }
        if from != self.identity.remote_user_id {
            debug!("Dropping {} from unexpected sender {}", signal.kind(), from);
            return false;
        }
        if let Some((timestamp, signature)) = signal.stamp() {
            if !self.guard.verify(from, timestamp, signature) {
                debug!("Dropping {} from {} with invalid signature", signal.kind(), from);
                return false;
            }
        }
        true
    }

    async fn handle_signal(&mut self, signal: Signal) {
        if self.is_finished() || !self.accepts(&signal) {
            return;
        }

        match signal {
            Signal::Ready { .. } => {
                let was_waiting = self.state.phase() == Phase::AwaitingPeer;
                self.apply(Transition::PeerReady);
                // Our own Ready may have gone out before the peer subscribed
                if was_waiting {
                    self.announce_ready().await;
                }
                self.maybe_offer("peer-ready").await;
            }
            Signal::Offer { sdp, .. } => self.handle_offer(sdp).await,
            Signal::Answer { sdp, .. } => self.handle_answer(sdp).await,
            Signal::IceCandidate { candidate, .. } => self.handle_remote_candidate(candidate).await,
            Signal::Hangup { .. } => {
                info!("Call {} hung up by {}", self.session_id, self.identity.remote_user_id);
                self.teardown(Teardown::Remote).await;
            }
        }
    }

    async fn handle_offer(&mut self, sdp: String) {
        if self.transport.signaling_state() == SignalingState::Closed {
            return;
        }

        if let Err(e) = self
            .transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            self.report(e);
            return;
        }
        self.apply(Transition::OfferAccepted);
        self.drain_pending().await;

        match self.send_answer().await {
            Ok(()) => info!("Call {} answered", self.session_id),
            Err(e) => self.report(e),
        }
    }

    async fn handle_answer(&mut self, sdp: String) {
        let signaling = self.transport.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            debug!("Dropping answer received in {}", signaling);
            return;
        }

        if let Err(e) = self
            .transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            self.report(e);
            return;
        }
        self.drain_pending().await;
        info!("Call {} offer accepted by peer", self.session_id);
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.transport.signaling_state() == SignalingState::Closed {
            return;
        }

        if self.transport.has_remote_description().await {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Failed to add remote candidate: {}", e);
            }
        } else {
            self.state.queue_candidate(candidate);
            debug!(
                "Queued remote candidate ({} pending)",
                self.state.pending_count()
            );
        }
    }

    /// Apply queued candidates in arrival order, once
    async fn drain_pending(&mut self) {
        let pending = self.state.take_pending();
        if pending.is_empty() {
            return;
        }

        debug!("Applying {} queued candidates", pending.len());
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Failed to add queued candidate: {}", e);
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.is_finished() {
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let (timestamp, signature) = self.guard.stamp(&self.identity.local_user_id);
                let signal = Signal::IceCandidate {
                    from: self.identity.local_user_id.clone(),
                    candidate,
                    timestamp,
                    signature,
                };
                if let Err(e) = self.channel.send(&signal).await {
                    warn!("Failed to publish local candidate: {}", e);
                }
            }
            TransportEvent::RemoteTrack(track) => {
                if self.remote_stream.add_track(track) {
                    info!(
                        "Call {} remote stream now has {} tracks",
                        self.session_id,
                        self.remote_stream.tracks().len()
                    );
                    self.remote_tx.send_replace(Some(self.remote_stream.clone()));
                    self.events
                        .publish(CallEvent::RemoteStream(self.remote_stream.clone()));
                }
            }
            TransportEvent::ConnectionState(state) => {
                if state.is_failure() {
                    warn!("Call {} connection {}", self.session_id, state);
                }
                self.connection_tx.send_replace(state);
                self.events.publish(CallEvent::ConnectionStateChanged(state));
                if state == ConnectionState::Connected {
                    self.apply(Transition::Connected);
                }
            }
            TransportEvent::SignalingState(state) => {
                debug!("Call {} signaling state {}", self.session_id, state);
                self.signaling_tx.send_replace(state);
            }
        }
    }

    /// Release everything exactly once
    async fn teardown(&mut self, kind: Teardown) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if kind == Teardown::Local {
            let hangup = Signal::Hangup {
                from: self.identity.local_user_id.clone(),
            };
            match tokio::time::timeout(self.config.publish_timeout(), self.channel.send(&hangup))
                .await
            {
                Ok(Ok(())) => debug!("Hangup announced on {}", self.channel.topic()),
                Ok(Err(e)) => warn!("Failed to announce hangup: {}", e),
                Err(_) => warn!("Timed out announcing hangup on {}", self.channel.topic()),
            }
            tokio::time::sleep(self.config.hangup_grace()).await;
        }

        let stopped = self.local_stream.stop_all();
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport for {}: {}", self.session_id, e);
        }
        self.channel.close().await;

        self.apply(Transition::Close);
        self.signaling_tx.send_replace(SignalingState::Closed);
        self.connection_tx.send_replace(ConnectionState::Closed);
        self.remote_tx.send_replace(None);
        self.events
            .publish(CallEvent::ConnectionStateChanged(ConnectionState::Closed));

        let initiator = match kind {
            Teardown::Local => Some(HangupInitiator::Local),
            Teardown::Remote => Some(HangupInitiator::Remote),
            Teardown::Cancelled => None,
        };
        if let Some(initiator) = initiator {
            self.events.publish(CallEvent::HungUp { initiator });
        }

        info!(
            "Call {} closed ({:?}, {} tracks stopped)",
            self.session_id, kind, stopped
        );
    }
}

struct HandleInner {
    identity: CallIdentity,
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    cancelled: Arc<AtomicBool>,
    local_stream: LocalStream,
    events: Arc<EventBus>,
    connection_rx: watch::Receiver<ConnectionState>,
    remote_rx: watch::Receiver<Option<RemoteStream>>,
    signaling_rx: watch::Receiver<SignalingState>,
    phase_rx: watch::Receiver<Phase>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Last handle gone: stop further handler effects now, the task
        // releases the transport and subscription without announcing.
        self.cancelled.store(true, Ordering::Release);
        self.local_stream.stop_all();
    }
}

/// Control and observation surface of a running call
#[derive(Clone)]
pub struct CallHandle {
    inner: Arc<HandleInner>,
}

impl CallHandle {
    pub fn identity(&self) -> &CallIdentity {
        &self.inner.identity
    }

    /// Local stream, until the call closes
    pub fn local_stream(&self) -> Option<LocalStream> {
        if self.is_closed() {
            None
        } else {
            Some(self.inner.local_stream.clone())
        }
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner.remote_rx.borrow().clone()
    }

    pub fn remote_stream_watch(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.inner.remote_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_rx.borrow()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_rx.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        *self.inner.signaling_rx.borrow()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    pub fn is_media_ready(&self) -> bool {
        !self.inner.local_stream.tracks().is_empty()
    }

    pub fn is_muted(&self) -> bool {
        self.inner
            .local_stream
            .audio_track()
            .is_some_and(|t| !t.is_enabled())
    }

    pub fn is_camera_off(&self) -> bool {
        self.inner
            .local_stream
            .video_track()
            .is_some_and(|t| !t.is_enabled())
    }

    /// Flip the microphone. Returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        self.inner.local_stream.toggle_mute();
        self.is_muted()
    }

    /// Flip the camera. Returns the new camera-off state.
    pub fn toggle_camera(&self) -> bool {
        self.inner.local_stream.toggle_camera();
        self.is_camera_off()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Announce the hangup to the peer and tear down. Safe to call repeatedly;
    /// only the first call has any effect.
    pub async fn hangup(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.commands.send(Command::Hangup(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Tear down without announcing (leaving the call page)
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.commands.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Wait until the call is closed
    pub async fn closed(&self) {
        let mut rx = self.inner.connection_rx.clone();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Hang up once the transport stays failed or disconnected for the
    /// configured delay. The task does not keep the call alive.
    pub fn spawn_failure_hangup(&self) -> JoinHandle<()> {
        let delay = self.inner.config.failure_hangup_delay();
        let weak = Arc::downgrade(&self.inner);
        let mut state_rx = self.inner.connection_rx.clone();

        tokio::spawn(async move {
            loop {
                let failed = state_rx
                    .wait_for(|s| s.is_failure() || *s == ConnectionState::Closed)
                    .await
                    .map(|s| *s != ConnectionState::Closed);
                if !matches!(failed, Ok(true)) {
                    return;
                }

                let recovered = tokio::time::timeout(delay, state_rx.wait_for(|s| !s.is_failure()))
                    .await
                    .map(|r| r.is_ok());
                match recovered {
                    Ok(true) => continue,
                    Ok(false) => return,
                    Err(_) => {
                        if let Some(inner) = weak.upgrade() {
                            warn!(
                                "Call {} transport did not recover in {:?}, hanging up",
                                inner.identity.request_id, delay
                            );
                            CallHandle { inner }.hangup().await;
                        }
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaError, RemoteTrack, SyntheticMediaSource, TrackKind};
    use crate::relay::{LocalRelay, Subscription};
    use crate::webrtc::guard::{now_ms, sign};
    use crate::webrtc::mock::MockFactory;

    const REQ: &str = "req-1";
    const TOPIC: &str = "call:req-1";
    const WINDOW: Duration = Duration::from_millis(150);

    fn identity(role: Role) -> CallIdentity {
        match role {
            Role::Talker => CallIdentity::new(REQ, "talker", "listener", Role::Talker),
            Role::Listener => CallIdentity::new(REQ, "listener", "talker", Role::Listener),
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            hangup_grace_ms: 10,
            publish_timeout_ms: 100,
            failure_hangup_delay_ms: 50,
            ..SessionConfig::default()
        }
    }

    fn session(role: Role, relay: &Arc<LocalRelay>, factory: &Arc<MockFactory>) -> CallSession {
        CallSession::new(
            identity(role),
            relay.clone(),
            factory.clone(),
            Arc::new(SyntheticMediaSource::new()),
        )
        .with_config(fast_config())
    }

    async fn start(role: Role, relay: &Arc<LocalRelay>, factory: &Arc<MockFactory>) -> CallHandle {
        session(role, relay, factory).start().await.unwrap()
    }

    async fn observe(relay: &Arc<LocalRelay>) -> Subscription {
        relay.subscribe(TOPIC).await.unwrap()
    }

    async fn inject(relay: &Arc<LocalRelay>, signal: Signal) {
        relay
            .publish(TOPIC, signal.to_json().unwrap())
            .await
            .unwrap();
    }

    /// Signals seen on the topic until it stays quiet for `WINDOW`
    async fn drain(sub: &mut Subscription) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(WINDOW, sub.messages.recv()).await {
            if let Ok(signal) = Signal::from_json(&msg.message) {
                signals.push(signal);
            }
        }
        signals
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_state(handle: &CallHandle, target: ConnectionState) {
        let mut rx = handle.connection_watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("timed out waiting for connection state")
            .unwrap();
    }

    fn count(signals: &[Signal], kind: &str, from: &str) -> usize {
        signals
            .iter()
            .filter(|s| s.kind() == kind && s.from() == from)
            .count()
    }

    fn signed_offer(from: &str, request_id: &str, timestamp: i64) -> Signal {
        Signal::Offer {
            from: from.into(),
            sdp: "remote-offer".into(),
            timestamp,
            signature: sign(from, request_id, timestamp),
        }
    }

    fn signed_candidate(from: &str, candidate: &str) -> Signal {
        let timestamp = now_ms();
        Signal::IceCandidate {
            from: from.into(),
            candidate: IceCandidate::new(candidate),
            timestamp,
            signature: sign(from, REQ, timestamp),
        }
    }

    fn drain_events(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_talker_offers_exactly_once() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let talker = start(Role::Talker, &relay, &factory).await;

        for _ in 0..3 {
            inject(&relay, Signal::Ready { from: "listener".into() }).await;
        }

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "offer", "talker"), 1);
        assert_eq!(factory.last().offers_created(), 1);
        assert_eq!(talker.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(talker.phase(), Phase::Offering);
        // Readiness is re-announced once for a peer that subscribed late
        assert_eq!(count(&signals, "ready", "talker"), 2);
    }

    #[tokio::test]
    async fn test_negotiation_completes_in_either_subscribe_order() {
        for talker_first in [true, false] {
            let relay = Arc::new(LocalRelay::new());
            let talker_factory = Arc::new(MockFactory::default());
            let listener_factory = Arc::new(MockFactory::default());

            let (talker, listener) = if talker_first {
                let t = start(Role::Talker, &relay, &talker_factory).await;
                let l = start(Role::Listener, &relay, &listener_factory).await;
                (t, l)
            } else {
                let l = start(Role::Listener, &relay, &listener_factory).await;
                let t = start(Role::Talker, &relay, &talker_factory).await;
                (t, l)
            };

            wait_state(&talker, ConnectionState::Connected).await;
            wait_state(&listener, ConnectionState::Connected).await;

            assert_eq!(talker_factory.last().offers_created(), 1);
            assert_eq!(talker.phase(), Phase::Connected);
            assert_eq!(listener.phase(), Phase::Connected);

            let listener_log = listener_factory.last().log();
            assert_eq!(listener_log[0], "remote:offer");
            assert!(listener_log.contains(&"local:answer".to_string()));
            eventually(|| {
                listener_factory
                    .last()
                    .applied_candidates()
                    .contains(&"host-req-1/talker".to_string())
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_early_candidates_queue_and_drain_in_order() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let listener = start(Role::Listener, &relay, &factory).await;

        for c in ["c1", "c2", "c3"] {
            inject(&relay, signed_candidate("talker", c)).await;
        }
        inject(&relay, signed_offer("talker", REQ, now_ms())).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "answer", "listener"), 1);

        let mock = factory.last();
        assert_eq!(mock.applied_candidates(), vec!["c1", "c2", "c3"]);
        let log = mock.log();
        let remote = log.iter().position(|l| l == "remote:offer").unwrap();
        let first = log.iter().position(|l| l == "candidate:c1").unwrap();
        let answer = log.iter().position(|l| l == "create:answer").unwrap();
        assert!(remote < first && first < answer);
        wait_state(&listener, ConnectionState::Connected).await;
        assert_eq!(listener.phase(), Phase::Connected);

        // Later candidates go straight to the transport
        inject(&relay, signed_candidate("talker", "c4")).await;
        eventually(|| mock.applied_candidates().len() == 4).await;
    }

    #[tokio::test]
    async fn test_double_hangup_is_idempotent() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let talker = start(Role::Talker, &relay, &factory).await;
        let mut events = talker.events();
        let stream = talker.local_stream().unwrap();

        tokio::join!(talker.hangup(), talker.hangup());
        talker.hangup().await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "hangup", "talker"), 1);
        assert_eq!(factory.last().close_calls(), 1);
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
        assert!(talker.local_stream().is_none());
        assert_eq!(talker.connection_state(), ConnectionState::Closed);

        let hung_up = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::HungUp { initiator: HangupInitiator::Local }))
            .count();
        assert_eq!(hung_up, 1);
        assert_eq!(relay.subscriber_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_stale_offer_rejected() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let listener = start(Role::Listener, &relay, &factory).await;

        inject(&relay, signed_offer("talker", REQ, now_ms() - 30_001)).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "answer", "listener"), 0);
        assert!(factory.last().log().is_empty());
        assert_eq!(listener.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_self_echo_offer_ignored() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let listener = start(Role::Listener, &relay, &factory).await;

        inject(&relay, signed_offer("listener", REQ, now_ms())).await;
        inject(&relay, signed_offer("mallory", REQ, now_ms())).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "answer", "listener"), 0);
        assert!(factory.last().log().is_empty());
        assert_eq!(listener.phase(), Phase::AwaitingPeer);
    }

    #[tokio::test]
    async fn test_foreign_hangup_ignored() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let listener = start(Role::Listener, &relay, &factory).await;
        let mut events = listener.events();

        inject(&relay, Signal::Hangup { from: "mallory".into() }).await;
        tokio::time::sleep(WINDOW).await;

        assert!(!listener.is_closed());
        assert_eq!(listener.phase(), Phase::AwaitingPeer);
        assert_eq!(factory.last().close_calls(), 0);
        assert!(listener.local_stream().is_some());
        assert!(drain_events(&mut events).is_empty());
        assert_eq!(relay.subscriber_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_overflowing_timestamp_dropped() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let listener = start(Role::Listener, &relay, &factory).await;

        inject(&relay, signed_offer("talker", REQ, i64::MIN)).await;
        inject(&relay, signed_offer("talker", REQ, i64::MAX)).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "answer", "listener"), 0);
        assert!(factory.last().log().is_empty());
        assert_eq!(listener.phase(), Phase::AwaitingPeer);

        // The session keeps running and still tears down normally
        listener.hangup().await;
        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "hangup", "listener"), 1);
        assert_eq!(factory.last().close_calls(), 1);
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_offer_signed_for_other_call_dropped() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let listener = start(Role::Listener, &relay, &factory).await;
        let mut events = listener.events();

        inject(&relay, signed_offer("talker", "req-2", now_ms())).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "answer", "listener"), 0);
        assert_eq!(listener.signaling_state(), SignalingState::Stable);
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_toggles_never_signal() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let talker = start(Role::Talker, &relay, &factory).await;
        let mut observer = observe(&relay).await;
        // Let the talker's own Ready go out first
        tokio::time::sleep(WINDOW).await;
        drain(&mut observer).await;

        assert!(talker.toggle_mute());
        assert!(talker.is_muted());
        assert!(talker.toggle_camera());
        assert!(talker.is_camera_off());
        assert!(!talker.toggle_mute());

        assert!(drain(&mut observer).await.is_empty());
        assert_eq!(talker.signaling_state(), SignalingState::Stable);
        let stream = talker.local_stream().unwrap();
        assert!(stream.tracks().iter().all(|t| !t.is_stopped()));
        assert_eq!(factory.last().tracks(), vec!["audio", "video"]);
    }

    #[tokio::test]
    async fn test_remote_hangup_cleans_up_without_echo() {
        let relay = Arc::new(LocalRelay::new());
        let talker_factory = Arc::new(MockFactory::default());
        let listener_factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;

        let listener = start(Role::Listener, &relay, &listener_factory).await;
        let talker = start(Role::Talker, &relay, &talker_factory).await;
        wait_state(&listener, ConnectionState::Connected).await;
        let mut listener_events = listener.events();
        let listener_stream = listener.local_stream().unwrap();

        talker.hangup().await;
        wait_state(&listener, ConnectionState::Closed).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "hangup", "talker"), 1);
        assert_eq!(count(&signals, "hangup", "listener"), 0);
        assert_eq!(listener_factory.last().close_calls(), 1);
        assert!(listener_stream.tracks().iter().all(|t| t.is_stopped()));

        let remote_hangups = drain_events(&mut listener_events)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::HungUp { initiator: HangupInitiator::Remote }))
            .count();
        assert_eq!(remote_hangups, 1);
    }

    #[tokio::test]
    async fn test_media_failure_never_subscribes() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let session = CallSession::new(
            identity(Role::Talker),
            relay.clone(),
            factory.clone(),
            Arc::new(SyntheticMediaSource::failing(MediaError::PermissionDenied)),
        );
        let mut events = session.events();

        let err = session.start().await.err().unwrap();
        assert!(matches!(err, AppError::Media(MediaError::PermissionDenied)));
        assert_eq!(relay.subscriber_count(TOPIC), 0);
        assert_eq!(factory.created_count(), 0);
        assert!(matches!(events.try_recv().unwrap(), CallEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_offer_failure_allows_one_retry() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::failing_offers(1));
        let mut observer = observe(&relay).await;
        let talker = start(Role::Talker, &relay, &factory).await;
        let mut events = talker.events();

        inject(&relay, Signal::Ready { from: "listener".into() }).await;
        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "offer", "talker"), 0);
        assert_eq!(talker.phase(), Phase::Ready);
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, CallEvent::Error(err) if matches!(**err, AppError::Negotiation(_)))));

        inject(&relay, Signal::Ready { from: "listener".into() }).await;
        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "offer", "talker"), 1);
        assert_eq!(factory.last().offers_created(), 1);
    }

    #[tokio::test]
    async fn test_stale_answer_dropped() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let talker = start(Role::Talker, &relay, &factory).await;
        let mut events = talker.events();

        let timestamp = now_ms();
        inject(
            &relay,
            Signal::Answer {
                from: "listener".into(),
                sdp: "late".into(),
                timestamp,
                signature: sign("listener", REQ, timestamp),
            },
        )
        .await;
        tokio::time::sleep(WINDOW).await;

        assert!(factory.last().log().is_empty());
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_hangup_completes_when_relay_stalls() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let talker = start(Role::Talker, &relay, &factory).await;
        let mut events = talker.events();
        tokio::time::sleep(WINDOW).await;

        relay.set_stalled(true);
        tokio::time::timeout(Duration::from_secs(1), talker.hangup())
            .await
            .expect("hangup must not wait on the relay");

        assert_eq!(factory.last().close_calls(), 1);
        assert_eq!(relay.subscriber_count(TOPIC), 0);
        assert!(drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, CallEvent::HungUp { .. })));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_without_announcing() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let talker = start(Role::Talker, &relay, &factory).await;
        let stream = talker.local_stream().unwrap();
        let mock = factory.last();

        drop(talker);
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
        eventually(|| mock.close_calls() == 1).await;
        eventually(|| relay.subscriber_count(TOPIC) == 1).await;

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "hangup", "talker"), 0);
    }

    #[tokio::test]
    async fn test_failure_watchdog_hangs_up() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let mut observer = observe(&relay).await;
        let talker = start(Role::Talker, &relay, &factory).await;
        let watchdog = talker.spawn_failure_hangup();

        factory
            .last()
            .emit(TransportEvent::ConnectionState(ConnectionState::Failed));
        wait_state(&talker, ConnectionState::Closed).await;
        watchdog.await.unwrap();

        let signals = drain(&mut observer).await;
        assert_eq!(count(&signals, "hangup", "talker"), 1);
    }

    #[tokio::test]
    async fn test_failure_watchdog_tolerates_flicker() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let talker = start(Role::Talker, &relay, &factory).await;
        let _watchdog = talker.spawn_failure_hangup();
        let mock = factory.last();

        mock.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
        mock.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        tokio::time::sleep(WINDOW).await;

        assert_eq!(talker.connection_state(), ConnectionState::Connected);
        assert_eq!(mock.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_tracks_grouped_into_one_stream() {
        let relay = Arc::new(LocalRelay::new());
        let factory = Arc::new(MockFactory::default());
        let talker = start(Role::Talker, &relay, &factory).await;
        let mut events = talker.events();
        let mock = factory.last();

        for (id, kind) in [("a", TrackKind::Audio), ("v", TrackKind::Video), ("a", TrackKind::Audio)] {
            mock.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id: id.into(),
                stream_id: "remote".into(),
                kind,
            }));
        }
        eventually(|| talker.remote_stream().is_some_and(|s| s.tracks().len() == 2)).await;

        let updates = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::RemoteStream(_)))
            .count();
        assert_eq!(updates, 2);
    }
}
