//! Event system for call notifications
//!
//! Each call session owns an event bus carrying [`CallEvent`]s to whoever
//! drives the UI (connection state, remote stream, errors, hangup).

pub mod types;

pub use types::{CallEvent, HangupInitiator};

use tokio::sync::broadcast;
use tracing::trace;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting call events
///
/// # Example
///
/// ```no_run
/// use talkline::events::{CallEvent, EventBus, HangupInitiator};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(CallEvent::HungUp {
///     initiator: HangupInitiator::Local,
/// });
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("Received event: {:?}", event);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn publish(&self, event: CallEvent) {
        trace!("Publishing {}", event.event_name());
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls more than the channel capacity behind receives a
    /// `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
