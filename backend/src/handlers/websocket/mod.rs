//! WebSocket surface: connection registry and first-frame role dispatch.
//!
//! Every connection starts unauthenticated. The first meaningful frame
//! decides the role: `admin-auth` hands the socket to the operator loop,
//! `join-session` to the listener loop. A socket that sends neither within
//! the grace window is closed.

mod admin_socket;
mod broadcast;
mod listener_socket;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::AppState;
use shared::{now_iso, ClientFrame, ServerFrame, SocketId};

pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// Live socket registry: the only map from connection handles to their
/// outbound channels. Senders enqueue; the per-socket send task owns the
/// actual sink, so frames emitted for one socket stay FIFO.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    sockets: Arc<DashMap<SocketId, FrameSender>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, socket: SocketId, sender: FrameSender) {
        self.sockets.insert(socket, sender);
    }

    pub fn unregister(&self, socket: SocketId) {
        self.sockets.remove(&socket);
    }

    /// Enqueue one frame; false when the socket is gone (frame dropped).
    pub fn send_to(&self, socket: SocketId, frame: ServerFrame) -> bool {
        match self.sockets.get(&socket) {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn broadcast_all(&self, frame: &ServerFrame) {
        for entry in self.sockets.iter() {
            let _ = entry.value().send(frame.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

pub async fn handle_hub_websocket(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, addr))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, addr: SocketAddr) {
    let socket_id: SocketId = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    app_state.connections.register(socket_id, tx.clone());
    debug!("socket {} connected from {}", socket_id, addr);

    match wait_for_role(&app_state, &tx, &mut ws_receiver).await {
        Some(frame @ ClientFrame::AdminAuth { .. }) => {
            admin_socket::run(&app_state, socket_id, &tx, &mut ws_receiver, addr, frame).await;
        }
        Some(frame @ ClientFrame::JoinSession { .. }) => {
            listener_socket::run(&app_state, socket_id, &tx, &mut ws_receiver, frame).await;
        }
        Some(other) => {
            warn!(
                "socket {} sent {} before authenticating, closing",
                socket_id,
                frame_name(&other)
            );
            let _ = tx.send(HubError::AccessDenied.to_listener_frame());
        }
        None => {
            debug!("socket {} closed before choosing a role", socket_id);
        }
    }

    // Cleanup is role-agnostic: whatever this socket was, forget it.
    app_state.connections.unregister(socket_id);
    app_state.identity_store.remove_active_socket(socket_id);
    app_state.registry.clear_admin_socket(socket_id);
    if let Some(session_id) = app_state.registry.remove_listener(socket_id) {
        listener_socket::notify_operator_roster_changed(&app_state, &session_id);
    }

    send_task.abort();
    debug!("socket {} disconnected", socket_id);
}

/// Wait for the role-deciding first frame within the auth grace window.
/// Heartbeats are answered but do not extend the window.
async fn wait_for_role(
    app_state: &AppState,
    tx: &FrameSender,
    receiver: &mut SplitStream<WebSocket>,
) -> Option<ClientFrame> {
    let deadline = Instant::now() + app_state.config.auth_grace_window;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let _ = tx.send(ServerFrame::Error {
                code: shared::ErrorCode::AccessDenied,
                message: "authentication window expired".to_string(),
                timestamp: now_iso(),
            });
            return None;
        }

        let msg = match tokio::time::timeout(remaining, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => continue,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Heartbeat) => {
                    let _ = tx.send(ServerFrame::Heartbeat);
                }
                Ok(frame) => return Some(frame),
                Err(e) => {
                    debug!("undecodable first frame: {}", e);
                    let _ = tx.send(
                        HubError::InvalidInput("unrecognized frame".to_string())
                            .to_listener_frame(),
                    );
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

pub(crate) fn frame_name(frame: &ClientFrame) -> &'static str {
    match frame {
        ClientFrame::AdminAuth { .. } => "admin-auth",
        ClientFrame::TokenRefresh { .. } => "token-refresh",
        ClientFrame::StartSession { .. } => "start-session",
        ClientFrame::EndSession { .. } => "end-session",
        ClientFrame::UpdateSessionConfig { .. } => "update-session-config",
        ClientFrame::ListSessions { .. } => "list-sessions",
        ClientFrame::AdminSessionAccess { .. } => "admin-session-access",
        ClientFrame::BroadcastTranslation { .. } => "broadcast-translation",
        ClientFrame::GenerateTts { .. } => "generate-tts",
        ClientFrame::TtsConfigUpdate { .. } => "tts-config-update",
        ClientFrame::LanguageUpdate { .. } => "language-update",
        ClientFrame::JoinSession { .. } => "join-session",
        ClientFrame::LeaveSession { .. } => "leave-session",
        ClientFrame::ChangeLanguage { .. } => "change-language",
        ClientFrame::Heartbeat => "heartbeat",
    }
}

/// Broadcast the shutdown notice to every connection; called by the server
/// shell before sockets are closed.
pub fn announce_shutdown(connections: &ConnectionManager, reason: &str) {
    info!("announcing shutdown to {} connections", connections.len());
    connections.broadcast_all(&ServerFrame::ServerShutdown {
        reason: reason.to_string(),
        reconnect: true,
        timestamp: now_iso(),
    });
}
