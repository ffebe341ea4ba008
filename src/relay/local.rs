//! In-process relay

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{RelayHub, SignalRelay, Subscription};
use crate::error::{AppError, Result};

/// Relay backed by an in-memory hub
///
/// Both peers of a call can share one `LocalRelay`. It can also be switched
/// offline (publishes fail) or stalled (publishes never complete) to exercise
/// the termination fallback.
pub struct LocalRelay {
    hub: Arc<RelayHub>,
    online: AtomicBool,
    stalled: AtomicBool,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::with_hub(Arc::new(RelayHub::new()))
    }

    pub fn with_hub(hub: Arc<RelayHub>) -> Self {
        Self {
            hub,
            online: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.hub.subscriber_count(topic)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Relay("relay unavailable".to_string()))
        }
    }
}

#[async_trait]
impl SignalRelay for LocalRelay {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_online()?;

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.join(topic, &id, tx);
        debug!("Local relay: {} joined {}", id, topic);

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            messages: rx,
        })
    }

    async fn publish(&self, topic: &str, message: String) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.ensure_online()?;

        self.hub.publish(topic, &message);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> Result<()> {
        self.hub.leave(topic, subscription_id);
        Ok(())
    }
}
