//! WebSocket relay server
//!
//! Serves `/relay`. Clients subscribe to topics and publish opaque messages;
//! every subscriber of the topic (publisher included) receives them.
//! Nothing is authenticated or persisted here: call membership is enforced by the
//! surrounding product and signals carry their own signature.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{RelayHub, RelayMessage};
use crate::error::{AppError, Result};

/// Heartbeat interval for idle connections
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-to-server frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, message: String },
}

/// Server-to-client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Subscription is active
    Subscribed { topic: String },
    /// Message published on a subscribed topic
    Message { topic: String, message: String },
    Error { message: String },
}

/// Build the relay router
pub fn router(hub: Arc<RelayHub>) -> Router {
    Router::new().route("/relay", get(ws_handler)).with_state(hub)
}

/// Serve the relay until the listener fails
pub async fn serve(bind: SocketAddr, hub: Arc<RelayHub>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Signal relay listening on ws://{}/relay", listener.local_addr()?);
    axum::serve(listener, router(hub))
        .await
        .map_err(|e| AppError::Relay(format!("Relay server failed: {}", e)))
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<RelayHub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayMessage>();

    debug!("Relay client {} connected", conn_id);

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_frame(&text, &conn_id, &tx, &hub);
                        if let Some(frame) = reply {
                            if send_frame(&mut sender, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay client {} socket error: {}", conn_id, e);
                        break;
                    }
                }
            }

            Some(delivery) = rx.recv() => {
                let frame = ServerFrame::Message {
                    topic: delivery.topic,
                    message: delivery.message,
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.leave_all(&conn_id);
    debug!(
        "Relay client {} disconnected ({} topics active)",
        conn_id,
        hub.topic_count()
    );
}

/// Apply one client frame. Returns the frame to send back, if any.
fn handle_client_frame(
    text: &str,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<RelayMessage>,
    hub: &RelayHub,
) -> Option<ServerFrame> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(ServerFrame::Error {
                message: format!("malformed frame: {}", e),
            })
        }
    };

    match frame {
        ClientFrame::Subscribe { topic } => {
            hub.join(&topic, conn_id, tx.clone());
            debug!("Relay client {} subscribed to {}", conn_id, topic);
            Some(ServerFrame::Subscribed { topic })
        }
        ClientFrame::Unsubscribe { topic } => {
            hub.leave(&topic, conn_id);
            None
        }
        ClientFrame::Publish { topic, message } => {
            let delivered = hub.publish(&topic, &message);
            debug!("Relay {} -> {} subscribers", topic, delivered);
            None
        }
    }
}

async fn send_frame<S>(sender: &mut S, frame: &ServerFrame) -> std::result::Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
