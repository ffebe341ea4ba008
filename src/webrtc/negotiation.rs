//! Negotiation phase
//!
//! Readiness, the one-shot offer guard and teardown are one tagged [`Phase`]
//! value. Every change goes through [`NegotiationState::apply`].
//!
//! ```text
//! Idle{peer_ready} --LocalReady--> AwaitingPeer --PeerReady--> Ready
//!        \--(peer_ready)--LocalReady----------------------------^ |
//! Ready --OfferStarted--> Offering --OfferFailed--> Ready         |
//! any live --OfferAccepted--> Answering                           |
//! Offering|Answering --Connected--> Connected                     |
//! any --Close--> Closed                                           v
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::signaling::{IceCandidate, SignalingState};

/// Call role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Talker,
    Listener,
}

impl Role {
    /// The talker creates the only offer
    pub fn is_offerer(&self) -> bool {
        matches!(self, Role::Talker)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Talker => write!(f, "talker"),
            Role::Listener => write!(f, "listener"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "talker" => Ok(Role::Talker),
            "listener" => Ok(Role::Listener),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not subscribed yet; the peer may already have announced itself
    Idle { peer_ready: bool },
    /// Subscribed and announced, peer not seen
    AwaitingPeer,
    /// Both sides announced
    Ready,
    /// Offer created and published
    Offering,
    /// Remote offer applied, answering
    Answering,
    /// Transport connected
    Connected,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle { .. } => write!(f, "idle"),
            Phase::AwaitingPeer => write!(f, "awaiting-peer"),
            Phase::Ready => write!(f, "ready"),
            Phase::Offering => write!(f, "offering"),
            Phase::Answering => write!(f, "answering"),
            Phase::Connected => write!(f, "connected"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

/// Phase transition inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Local subscription active and `Ready` published
    LocalReady,
    /// Peer `Ready` observed
    PeerReady,
    /// Offer creation begins
    OfferStarted,
    /// Offer creation or publishing failed
    OfferFailed,
    /// Remote offer applied
    OfferAccepted,
    /// Transport reported `connected`
    Connected,
    Close,
}

/// Per-call negotiation state
#[derive(Debug)]
pub struct NegotiationState {
    role: Role,
    phase: Phase,
    pending_candidates: VecDeque<IceCandidate>,
}

impl NegotiationState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Idle { peer_ready: false },
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Apply a transition. Returns false when it does not apply to the current
    /// phase, in which case nothing changes.
    pub fn apply(&mut self, transition: Transition) -> bool {
        use Phase::*;

        let next = match (self.phase, transition) {
            (Closed, _) => None,
            (_, Transition::Close) => Some(Closed),

            (Idle { peer_ready: false }, Transition::LocalReady) => Some(AwaitingPeer),
            (Idle { peer_ready: true }, Transition::LocalReady) => Some(Ready),
            (Idle { peer_ready: false }, Transition::PeerReady) => Some(Idle { peer_ready: true }),
            (AwaitingPeer, Transition::PeerReady) => Some(Ready),

            (Ready, Transition::OfferStarted) if self.role.is_offerer() => Some(Offering),
            (Offering, Transition::OfferFailed) => Some(Ready),

            (Idle { .. } | AwaitingPeer | Ready | Offering | Answering, Transition::OfferAccepted) => {
                Some(Answering)
            }

            (Offering | Answering, Transition::Connected) => Some(Connected),

            _ => None,
        };

        match next {
            Some(phase) => {
                self.phase = phase;
                if phase == Closed {
                    self.pending_candidates.clear();
                }
                true
            }
            None => false,
        }
    }

    /// Whether the offer trigger fires now
    pub fn should_offer(&self, signaling: SignalingState) -> bool {
        self.role.is_offerer() && self.phase == Phase::Ready && signaling == SignalingState::Stable
    }

    pub fn local_ready(&self) -> bool {
        !matches!(self.phase, Phase::Idle { .. } | Phase::Closed)
    }

    pub fn other_ready(&self) -> bool {
        matches!(
            self.phase,
            Phase::Idle { peer_ready: true }
                | Phase::Ready
                | Phase::Offering
                | Phase::Answering
                | Phase::Connected
        )
    }

    pub fn has_offered_once(&self) -> bool {
        self.phase == Phase::Offering || (self.role.is_offerer() && self.phase == Phase::Connected)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Hold a candidate until a remote description exists
    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        if !self.is_closed() {
            self.pending_candidates.push_back(candidate);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Take every queued candidate in arrival order
    pub fn take_pending(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain(..).collect()
    }
}
