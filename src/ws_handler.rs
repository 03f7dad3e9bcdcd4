use crate::auth::{authenticate_token, AuthUser};
use crate::errors::AppError;
use crate::events::{rooms_for, Envelope};
use crate::handlers::AppState;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which the peer is considered gone.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
enum ClientFrame {
    #[serde(rename = "join-room")]
    JoinRoom(String),
    #[serde(rename = "leave-room")]
    LeaveRoom(String),
}

/// Room membership of one socket. `entitled` is fixed at connect time from
/// the token; `joined` starts equal to it and changes through
/// `join-room`/`leave-room` frames.
#[derive(Debug, Clone)]
pub struct Membership {
    entitled: HashSet<String>,
    joined: HashSet<String>,
}

impl Membership {
    pub fn for_user(user: &AuthUser) -> Self {
        let entitled = rooms_for(user.id, user.role, user.organization_id);
        Self {
            joined: entitled.clone(),
            entitled,
        }
    }

    pub fn joined(&self) -> &HashSet<String> {
        &self.joined
    }

    pub fn wants(&self, envelope: &Envelope) -> bool {
        envelope.is_for(&self.joined)
    }

    /// Apply a client text frame and return the reply to send back, if any.
    pub fn handle_frame(&mut self, text: &str) -> Option<String> {
        let reply = match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::JoinRoom(room)) if self.entitled.contains(&room) => {
                self.joined.insert(room.clone());
                json!({ "event": "room-joined", "data": room })
            }
            Ok(ClientFrame::JoinRoom(room)) => {
                tracing::warn!("Refused join of room {}", room);
                json!({ "event": "error", "data": format!("Not allowed to join room {}", room) })
            }
            Ok(ClientFrame::LeaveRoom(room)) => {
                self.joined.remove(&room);
                json!({ "event": "room-left", "data": room })
            }
            Err(_) => {
                tracing::debug!("Ignoring unrecognized socket frame");
                return None;
            }
        };
        Some(reply.to_string())
    }
}

/// GET /socket?token=...
///
/// Authenticates the token before upgrading, then streams every lead event
/// addressed to one of the socket's rooms.
pub async fn socket_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = match query.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => return AppError::Unauthorized("Missing token".to_string()).into_response(),
    };
    let user = match authenticate_token(&state, token).await {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: AuthUser) {
    let membership = Membership::for_user(&user);
    tracing::info!(
        "🔌 Socket connected: {} ({}) rooms {:?}",
        user.name,
        user.role,
        membership.joined()
    );

    let (sender, receiver) = socket.split();
    let rx = state.broadcaster.subscribe();
    run_socket_loop(sender, receiver, rx, membership).await;

    tracing::info!("🔌 Socket closed: {}", user.name);
}

/// Forward matching events, apply client frames and keep the connection
/// alive with pings until either side goes away.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Envelope>,
    mut membership: Membership,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_seen.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("Socket timed out waiting for pong");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        if !membership.wants(&envelope) {
                            continue;
                        }
                        if sender.send(Message::Text(envelope.json.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Socket lagged, skipped {} event(s)", skipped);
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Some(reply) = membership.handle_frame(&text) {
                            if sender.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
