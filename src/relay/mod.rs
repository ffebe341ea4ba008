//! Signal relay
//!
//! The relay is a dumb topic-scoped broadcast: every subscriber of a topic
//! (including the publisher) receives every message published to it. Ordering is
//! best-effort and nothing is persisted.
//!
//! ```text
//! CallSession --SignalChannel("call:<requestId>")--> SignalRelay
//!                                                   |-- LocalRelay (in-process hub)
//!                                                   |-- WsRelay ---> relay server (hub)
//! ```

pub mod hub;
pub mod local;
pub mod server;
pub mod ws;

pub use hub::{RelayHub, RelayMessage};
pub use local::LocalRelay;
pub use server::serve;
pub use ws::WsRelay;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::webrtc::signaling::Signal;

/// An active subscription to one topic
#[derive(Debug)]
pub struct Subscription {
    /// Subscriber id, unique per subscription
    pub id: String,
    /// Topic name
    pub topic: String,
    /// Incoming messages
    pub messages: mpsc::UnboundedReceiver<RelayMessage>,
}

/// Broadcast relay used for call signaling
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Subscribe to a topic. Resolves once the subscription is active.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Publish an opaque message to every subscriber of a topic
    async fn publish(&self, topic: &str, message: String) -> Result<()>;

    /// Release a subscription created by [`SignalRelay::subscribe`]
    async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> Result<()>;
}

/// Relay topic for a call
pub fn call_topic(request_id: &str) -> String {
    format!("call:{}", request_id)
}

/// Typed signal channel over a relay subscription
///
/// Owns exactly one subscription; [`SignalChannel::close`] releases it once.
pub struct SignalChannel {
    relay: Arc<dyn SignalRelay>,
    topic: String,
    subscription_id: String,
    messages: mpsc::UnboundedReceiver<RelayMessage>,
    closed: bool,
}

impl SignalChannel {
    /// Subscribe to the call topic
    pub async fn open(relay: Arc<dyn SignalRelay>, request_id: &str) -> Result<Self> {
        let topic = call_topic(request_id);
        let subscription = relay.subscribe(&topic).await?;
        debug!("Signal channel {} subscribed ({})", topic, subscription.id);

        Ok(Self {
            relay,
            topic,
            subscription_id: subscription.id,
            messages: subscription.messages,
            closed: false,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a signal. Fails once the channel is closed.
    pub async fn send(&self, signal: &Signal) -> Result<()> {
        if self.closed {
            return Err(AppError::Closed);
        }
        let message = signal.to_json()?;
        self.relay.publish(&self.topic, message).await
    }

    /// Next well-formed signal. Malformed messages are dropped.
    ///
    /// Returns None once the relay ends the subscription.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            let message = self.messages.recv().await?;
            match Signal::from_json(&message.message) {
                Ok(signal) => return Some(signal),
                Err(e) => debug!("Dropping malformed message on {}: {}", self.topic, e),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Unsubscribe. Later calls are no-ops.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.messages.close();

        if let Err(e) = self
            .relay
            .unsubscribe(&self.topic, &self.subscription_id)
            .await
        {
            warn!("Failed to unsubscribe from {}: {}", self.topic, e);
        } else {
            debug!("Signal channel {} unsubscribed", self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_topic() {
        assert_eq!(call_topic("req-1"), "call:req-1");
    }

    #[tokio::test]
    async fn test_channel_skips_malformed() {
        let relay = Arc::new(LocalRelay::new());
        let mut channel = SignalChannel::open(relay.clone(), "r").await.unwrap();

        relay.publish("call:r", "garbage".into()).await.unwrap();
        channel
            .send(&Signal::Ready { from: "a".into() })
            .await
            .unwrap();

        assert_eq!(channel.recv().await, Some(Signal::Ready { from: "a".into() }));
    }

    #[tokio::test]
    async fn test_channel_close_unsubscribes_once() {
        let relay = Arc::new(LocalRelay::new());
        let mut channel = SignalChannel::open(relay.clone(), "r").await.unwrap();
        assert_eq!(relay.subscriber_count("call:r"), 1);

        channel.close().await;
        channel.close().await;
        assert!(channel.is_closed());
        assert_eq!(relay.subscriber_count("call:r"), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let relay = Arc::new(LocalRelay::new());
        let mut observer = relay.subscribe("call:r").await.unwrap();
        let mut channel = SignalChannel::open(relay.clone(), "r").await.unwrap();
        channel.close().await;

        let result = channel.send(&Signal::Hangup { from: "a".into() }).await;
        assert!(matches!(result, Err(AppError::Closed)));
        assert!(observer.messages.try_recv().is_err());
    }
}
