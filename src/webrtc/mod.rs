//! Peer connection negotiation for one-on-one calls
//!
//! A talker and a listener meet on a relay topic, announce readiness, and
//! exchange one offer/answer pair plus trickled ICE candidates. All signals
//! except hangup carry a timestamp and a checksum bound to the call.
//!
//! Architecture:
//! ```text
//! MediaSource --LocalStream--> CallSession::start()
//!                                    |
//!                                    v
//!   SignalChannel <--Signal--> SessionActor <--TransportEvent-- MediaTransport
//!   (call:<id>)                      |                          (RtcTransport)
//!                                    v
//!                        CallHandle (watch + EventBus)
//! ```

pub mod config;
pub mod guard;
#[cfg(test)]
mod mock;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{RtcConfig, TurnServer};
pub use guard::SignatureGuard;
pub use negotiation::{NegotiationState, Phase, Role, Transition};
pub use peer::{RtcTransport, RtcTransportFactory};
pub use session::{CallHandle, CallIdentity, CallSession, SessionConfig};
pub use signaling::{
    ConnectionState, IceCandidate, SdpKind, SessionDescription, Signal, SignalingState,
};
pub use transport::{MediaTransport, TransportEvent, TransportEventSender, TransportFactory};
