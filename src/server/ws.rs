use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::auth::{decode_access_token, normalize_email};
use super::extract::{Path, Query};
use super::models::*;

/// How often to send the text keepalive `"ping"`.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a `"pong"` before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// RFC 6455 policy-violation close code.
const POLICY_VIOLATION: u16 = 1008;

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    AuthUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        authenticated: bool,
    },
    GoalCreated {
        goal: Goal,
    },
    GoalUpdated {
        goal: Goal,
    },
    GoalDeleted {
        goal_id: i64,
    },
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskDeleted {
        task_id: i64,
    },
    PreferencesUpdated {
        preferences: Preferences,
    },
}

/// A serialized message addressed to every session of one user.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub user: String,
    pub payload: String,
}

// ── Hub ──────────────────────────────────────────────────────────────

/// Fan-out point for per-user realtime messages plus a registry of live
/// sessions. Every socket subscribes to one broadcast channel and drops
/// envelopes addressed to other users.
#[derive(Clone)]
pub struct WsHub {
    tx: broadcast::Sender<Envelope>,
    sessions: Arc<Mutex<HashMap<String, usize>>>,
}

impl WsHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Serialize and deliver a message to all sessions of `user`.
    /// Returns silently when the user has no open sockets.
    pub fn send_to(&self, user: &str, msg: &WsMessage) {
        match serde_json::to_string(msg) {
            Ok(payload) => {
                let _ = self.tx.send(Envelope {
                    user: user.to_string(),
                    payload,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize WsMessage");
            }
        }
    }

    /// Tell every session of `user` that its authentication changed.
    pub fn auth_update(&self, user: &str, authenticated: bool) {
        self.send_to(
            user,
            &WsMessage::AuthUpdate {
                user_id: user.to_string(),
                authenticated,
            },
        );
    }

    pub fn session_count(&self, user: &str) -> usize {
        self.sessions
            .lock()
            .map(|s| s.get(user).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Register a live session; it is removed again when the guard drops.
    pub fn register(&self, user: &str) -> SessionGuard {
        if let Ok(mut sessions) = self.sessions.lock() {
            *sessions.entry(user.to_string()).or_insert(0) += 1;
        }
        SessionGuard {
            user: user.to_string(),
            sessions: self.sessions.clone(),
        }
    }
}

pub struct SessionGuard {
    user: String,
    sessions: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut sessions) = self.sessions.lock()
            && let Some(count) = sessions.get_mut(&self.user)
        {
            *count -= 1;
            if *count == 0 {
                sessions.remove(&self.user);
            }
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Outcome of checking a connection's token against the path.
#[derive(Debug, PartialEq)]
enum Admission {
    Accept(String),
    Reject(&'static str),
}

fn admit(state: &SharedState, user_email: &str, token: Option<&str>) -> Admission {
    let Some(claims) = token.and_then(|t| decode_access_token(&state.config.auth, t).ok()) else {
        return Admission::Reject("Invalid token");
    };
    if claims.sub != normalize_email(user_email) {
        return Admission::Reject("User ID mismatch");
    }
    Admission::Accept(claims.sub)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_email): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let admission = admit(&state, &user_email, query.token.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_email, admission))
}

async fn handle_socket(
    socket: WebSocket,
    state: SharedState,
    user_email: String,
    admission: Admission,
) {
    let (sender, receiver) = socket.split();
    serve_session(sender, receiver, state, user_email, admission).await;
}

/// The 1008 close sent to a connection that fails admission.
fn rejection(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: POLICY_VIOLATION,
        reason: reason.into(),
    }))
}

async fn serve_session<S, R>(
    mut sender: S,
    receiver: R,
    state: SharedState,
    user_email: String,
    admission: Admission,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let user = match admission {
        Admission::Accept(user) => user,
        Admission::Reject(reason) => {
            tracing::warn!(user = %user_email, reason, "rejecting websocket connection");
            let _ = sender.send(rejection(reason)).await;
            return;
        }
    };

    let rx = state.hub.subscribe();
    let _session = state.hub.register(&user);
    tracing::info!(user = %user, sessions = state.hub.session_count(&user), "websocket connected");

    run_socket_loop(sender, receiver, rx, &user).await;

    tracing::info!(user = %user, "websocket disconnected");
}

/// Forward this user's envelopes and keep the socket alive with text
/// `"ping"`s. Ends when the socket goes away or no `"pong"` (text or
/// protocol frame) has arrived for [`PONG_TIMEOUT`].
async fn run_socket_loop<S, R>(
    mut sender: S,
    mut receiver: R,
    mut rx: broadcast::Receiver<Envelope>,
    user: &str,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // Skip the immediate first tick.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(user, "pong timeout");
                    break;
                }
                if sender.send(Message::Text("ping".into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(envelope) if envelope.user == user => {
                        if sender.send(Message::Text(envelope.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(user, skipped, "websocket lagged behind broadcast");
                        continue;
                    }
                }
            }

            // ── Client keepalive ────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text.as_str() == "pong" => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                        if sender.send(Message::Text("pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(user, message = %text.as_str(), "ignoring client message");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
