//! Topic table shared by the in-process relay and the relay server

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// A message delivered on a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub topic: String,
    pub message: String,
}

/// Subscribers by topic
#[derive(Default)]
pub struct RelayHub {
    topics: Mutex<HashMap<String, HashMap<String, mpsc::UnboundedSender<RelayMessage>>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber_id` on `topic`. Re-joining replaces the sender.
    pub fn join(
        &self,
        topic: &str,
        subscriber_id: &str,
        sender: mpsc::UnboundedSender<RelayMessage>,
    ) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), sender);
    }

    /// Remove `subscriber_id` from `topic`. Returns false if it was not subscribed.
    pub fn leave(&self, topic: &str, subscriber_id: &str) -> bool {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(subscriber_id).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Remove `subscriber_id` from every topic
    pub fn leave_all(&self, subscriber_id: &str) {
        let mut topics = self.topics.lock();
        topics.retain(|_, subscribers| {
            subscribers.remove(subscriber_id);
            !subscribers.is_empty()
        });
    }

    /// Deliver to every live subscriber of `topic`, returning the delivery count
    pub fn publish(&self, topic: &str, message: &str) -> usize {
        let targets: Vec<(String, mpsc::UnboundedSender<RelayMessage>)> = {
            let topics = self.topics.lock();
            match topics.get(topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            let msg = RelayMessage {
                topic: topic.to_string(),
                message: message.to_string(),
            };
            if tx.send(msg).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        for id in dead {
            trace!("Pruning closed subscriber {} on {}", id, topic);
            self.leave(topic, &id);
        }

        delivered
    }

    /// Drop every subscriber, ending their subscriptions
    pub fn clear(&self) {
        self.topics.lock().clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |s| s.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}
