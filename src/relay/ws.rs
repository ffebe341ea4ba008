//! WebSocket relay client

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::server::{ClientFrame, ServerFrame};
use super::{RelayHub, SignalRelay, Subscription};
use crate::error::{AppError, Result};

/// How long to wait for the server to confirm a subscription
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

type PendingAcks = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>>;

/// Relay client over one WebSocket connection
///
/// Local subscribers share the connection; the server-side subscription for a
/// topic is dropped when the last local subscriber leaves.
pub struct WsRelay {
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    local: Arc<RelayHub>,
    pending_acks: PendingAcks,
    io_task: JoinHandle<()>,
}

impl WsRelay {
    /// Connect to a relay server, e.g. `ws://127.0.0.1:8787/relay`
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| AppError::Relay(format!("Failed to connect to {}: {}", url, e)))?;
        info!("Connected to signal relay {}", url);

        let (mut write, mut read) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let local = Arc::new(RelayHub::new());
        let pending_acks: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        let hub = local.clone();
        let acks = pending_acks.clone();
        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outgoing_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode relay frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("Relay send failed: {}", e);
                            break;
                        }
                    }

                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => handle_server_frame(&text, &hub, &acks),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Relay connection error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            // Ends every local subscription
            hub.clear();
            acks.lock().clear();
            debug!("Relay connection closed");
        });

        Ok(Self {
            outgoing,
            local,
            pending_acks,
            io_task,
        })
    }

    fn send(&self, frame: ClientFrame) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| AppError::Relay("relay connection closed".to_string()))
    }
}

fn handle_server_frame(text: &str, hub: &RelayHub, acks: &PendingAcks) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Subscribed { topic }) => {
            if let Some(waiters) = acks.lock().remove(&topic) {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
        }
        Ok(ServerFrame::Message { topic, message }) => {
            hub.publish(&topic, &message);
        }
        Ok(ServerFrame::Error { message }) => warn!("Relay reported error: {}", message),
        Err(e) => debug!("Ignoring malformed relay frame: {}", e),
    }
}

#[async_trait]
impl SignalRelay for WsRelay {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        // Acks are resolved under the same lock, so a subscriber joining while
        // the server has not confirmed the topic yet waits on the pending entry
        let (ack_rx, first) = {
            let mut acks = self.pending_acks.lock();
            let first = self.local.subscriber_count(topic) == 0;
            let ack_rx = if first || acks.contains_key(topic) {
                let (ack_tx, ack_rx) = oneshot::channel();
                acks.entry(topic.to_string()).or_default().push(ack_tx);
                Some(ack_rx)
            } else {
                None
            };
            self.local.join(topic, &id, tx);
            (ack_rx, first)
        };

        if first {
            if let Err(e) = self.send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            }) {
                self.local.leave(topic, &id);
                return Err(e);
            }
        }

        if let Some(ack_rx) = ack_rx {
            let result = match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(AppError::Relay("relay connection closed".to_string())),
                Err(_) => Err(AppError::Relay(format!(
                    "Subscription to {} was not confirmed",
                    topic
                ))),
            };
            if let Err(e) = result {
                self.local.leave(topic, &id);
                return Err(e);
            }
        }

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            messages: rx,
        })
    }

    async fn publish(&self, topic: &str, message: String) -> Result<()> {
        self.send(ClientFrame::Publish {
            topic: topic.to_string(),
            message,
        })
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> Result<()> {
        self.local.leave(topic, subscription_id);
        if self.local.subscriber_count(topic) == 0 {
            self.send(ClientFrame::Unsubscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(())
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}
