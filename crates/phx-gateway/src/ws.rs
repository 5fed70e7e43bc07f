//! `GET /ws` — the real-time event channel.
//!
//! A connected client first sends a `subscribe` message naming the topics
//! it wants (`experiments`, `deployments`, `agents`, ...); every
//! [`BusMessage`](phx_bus::BusMessage) published to those topics is then
//! forwarded as JSON. `unsubscribe` narrows the topic set back down,
//! `heartbeat` is a client-initiated no-op keepalive. The server sends its
//! own ping on `GatewayConfig::ws_ping_interval_secs` and drops the
//! connection if nothing is heard from the client within
//! `ws_read_deadline_secs`, or if a single outbound frame doesn't make it
//! out within `ws_write_deadline_secs`.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct TopicData {
    topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { data: TopicData },
    Unsubscribe { data: TopicData },
    Heartbeat,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    let subscription = state.bus.subscribe(session_id.clone(), Vec::<String>::new());
    let (mut tx, mut rx) = socket.split();

    let ping_interval = Duration::from_secs(state.config.gateway.ws_ping_interval_secs);
    let read_deadline = Duration::from_secs(state.config.gateway.ws_read_deadline_secs);
    let write_deadline = Duration::from_secs(state.config.gateway.ws_write_deadline_secs);
    let max_message_bytes = state.config.gateway.ws_max_message_bytes;

    let mut ping_tick = tokio::time::interval(ping_interval);
    ping_tick.tick().await;

    loop {
        tokio::select! {
            bus_msg = subscription.receiver.recv_async() => {
                let Ok(msg) = bus_msg else { break };
                let json = serde_json::to_string(&msg).unwrap_or_default();
                if tokio::time::timeout(write_deadline, tx.send(Message::Text(json.into()))).await.is_err() {
                    break;
                }
            }

            _ = ping_tick.tick() => {
                if tokio::time::timeout(write_deadline, tx.send(Message::Ping(Vec::new().into()))).await.is_err() {
                    break;
                }
            }

            incoming = tokio::time::timeout(read_deadline, rx.next()) => {
                match incoming {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if text.len() > max_message_bytes {
                            continue;
                        }
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { data }) => {
                                state.bus.add_topic(&session_id, data.topic);
                            }
                            Ok(ClientMessage::Unsubscribe { data }) => {
                                state.bus.remove_topic(&session_id, &data.topic);
                            }
                            Ok(ClientMessage::Heartbeat) => {}
                            Err(_) => {}
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(_))) => break,
                    Err(_) => break,
                }
            }
        }
    }

    state.bus.unsubscribe(&session_id);
}
