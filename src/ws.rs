//! Real-time push channel for farmers.
//!
//! ## Protocol
//!
//! Connect: `ws://host/ws?token=<access token>`
//!
//! Server -> client messages all share one envelope:
//!
//! ```json
//! {"type": "advisory", "data": {...}, "timestamp": 1735689600}
//! ```
//!
//! `type` is one of `advisory`, `reminder`, `notification`, `heartbeat`.
//! Clients may send `{"type": "ping"}` and receive a `pong`.

use crate::auth;
use crate::errors::SakhiError;
use crate::storage;
use crate::web::{ApiQuery, AppState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Advisory,
    Reminder,
    Notification,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
    pub timestamp: i64,
}

impl RealtimeMessage {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
}

/// Live connections, keyed by farmer id. Each farmer has one broadcast
/// channel shared by all of their open sockets.
#[derive(Debug)]
pub struct ConnectionHub {
    channels: DashMap<String, broadcast::Sender<RealtimeMessage>>,
    connections: AtomicUsize,
    heartbeat_secs: u64,
}

impl ConnectionHub {
    pub fn new(heartbeat_secs: u64) -> Self {
        Self {
            channels: DashMap::new(),
            connections: AtomicUsize::new(0),
            heartbeat_secs: heartbeat_secs.max(1),
        }
    }

    fn subscribe(&self, farmer_id: &str) -> broadcast::Receiver<RealtimeMessage> {
        let rx = self
            .channels
            .entry(farmer_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe();
        self.connections.fetch_add(1, Ordering::SeqCst);
        rx
    }

    /// Called after a connection's receiver has been dropped
    fn release(&self, farmer_id: &str) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
        self.channels
            .remove_if(farmer_id, |_, tx| tx.receiver_count() == 0);
    }

    /// Push to every open socket of a farmer. Returns whether anyone was listening.
    pub fn send_to_farmer(&self, farmer_id: &str, msg: RealtimeMessage) -> bool {
        self.channels
            .get(farmer_id)
            .map(|tx| tx.send(msg).is_ok())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn farmer_connection_count(&self, farmer_id: &str) -> usize {
        self.channels
            .get(farmer_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn connected_farmers(&self) -> usize {
        self.channels.len()
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<WsQuery>,
) -> Result<Response, SakhiError> {
    let user = auth::authenticate(&state.db, &state.jwks, &q.token).await?;
    let farmer = storage::get_farmer_by_user(&state.db, user.id())
        .await?
        .ok_or_else(|| SakhiError::not_found("Farmer profile"))?;
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, farmer.id)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ConnectionHub>, farmer_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = hub.subscribe(&farmer_id);
    let mut ticker = tokio::time::interval(Duration::from_secs(hub.heartbeat_secs));
    info!(farmer_id = %farmer_id, "WebSocket client connected");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let beat = RealtimeMessage::new(
                    MessageType::Heartbeat,
                    serde_json::json!({"interval_secs": hub.heartbeat_secs}),
                );
                if send_json(&mut sender, &beat).await.is_err() {
                    break;
                }
            }
            msg = rx.recv() => {
                match msg {
                    Ok(msg) => {
                        if send_json(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(farmer_id = %farmer_id, skipped = n, "WebSocket client lagging");
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Ping) = serde_json::from_str::<ClientMessage>(text.as_str()) {
                            let pong = serde_json::json!({"type": "pong", "timestamp": Utc::now().timestamp()});
                            if sender.send(Message::Text(pong.to_string().into())).await.is_err() {
                                break;
                            }
                        } else {
                            debug!(farmer_id = %farmer_id, "Ignoring client message");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(farmer_id = %farmer_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    drop(rx);
    hub.release(&farmer_id);
    info!(farmer_id = %farmer_id, "WebSocket connection closed");
}

async fn send_json<S>(sender: &mut S, msg: &RealtimeMessage) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_envelope_shape() {
        let msg = RealtimeMessage::new(MessageType::Advisory, serde_json::json!({"title": "Rain"}));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "advisory");
        assert_eq!(v["data"]["title"], "Rain");
        assert!(v["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_hub_routes_by_farmer() {
        let hub = ConnectionHub::new(30);
        assert!(!hub.send_to_farmer("f1", RealtimeMessage::new(MessageType::Reminder, Value::Null)));

        let mut rx1 = hub.subscribe("f1");
        let mut rx1b = hub.subscribe("f1");
        let _rx2 = hub.subscribe("f2");
        assert_eq!(hub.connection_count(), 3);
        assert_eq!(hub.farmer_connection_count("f1"), 2);
        assert_eq!(hub.connected_farmers(), 2);

        assert!(hub.send_to_farmer("f1", RealtimeMessage::new(MessageType::Reminder, Value::Null)));
        assert_eq!(rx1.recv().await.unwrap().kind, MessageType::Reminder);
        assert_eq!(rx1b.recv().await.unwrap().kind, MessageType::Reminder);

        drop(rx1);
        hub.release("f1");
        assert_eq!(hub.farmer_connection_count("f1"), 1);
        drop(rx1b);
        hub.release("f1");
        assert_eq!(hub.farmer_connection_count("f1"), 0);
        assert_eq!(hub.connected_farmers(), 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_client_ping_parses() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#),
            Ok(ClientMessage::Ping)
        ));
    }
}
