//! Listener connection lifecycle: join, change language, leave.
//!
//! Listeners are anonymous; errors use the legacy short `error` frame and a
//! failed join leaves the socket open so the client can retry with a
//! different session or language. Every roster change pushes a fresh
//! audience digest to the owning operator socket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::FrameSender;
use crate::error::HubError;
use crate::AppState;
use shared::{now_iso, ClientFrame, Language, ListenerCapabilities, ServerFrame, SocketId};

pub(super) async fn run(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    receiver: &mut SplitStream<WebSocket>,
    first_frame: ClientFrame,
) {
    if let ClientFrame::JoinSession {
        session_id,
        preferred_language,
        capabilities,
    } = first_frame
    {
        handle_join(app_state, socket_id, tx, &session_id, preferred_language, capabilities);
    }

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("listener {} sent undecodable frame: {}", socket_id, e);
                        continue;
                    }
                };
                handle_frame(app_state, socket_id, tx, frame);
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("listener socket {} error: {}", socket_id, e);
                break;
            }
            _ => {}
        }
    }
    // Roster removal happens in the shared disconnect cleanup.
}

fn handle_frame(app_state: &AppState, socket_id: SocketId, tx: &FrameSender, frame: ClientFrame) {
    match frame {
        ClientFrame::JoinSession {
            session_id,
            preferred_language,
            capabilities,
        } => {
            // Re-join: drop any current membership first.
            if let Some(previous) = app_state.registry.remove_listener(socket_id) {
                notify_operator_roster_changed(app_state, &previous);
            }
            handle_join(app_state, socket_id, tx, &session_id, preferred_language, capabilities);
        }
        ClientFrame::ChangeLanguage { new_language } => {
            match app_state.registry.change_listener_language(socket_id, new_language) {
                Ok((session_id, session)) => {
                    let _ = tx.send(ServerFrame::SessionMetadata {
                        session_id,
                        config: session.config.clone(),
                        status: session.status,
                        tts_available: session.tts_available() && app_state.tts.provider_configured(),
                        timestamp: now_iso(),
                    });
                    notify_operator_roster_changed(app_state, &session.session_id);
                }
                Err(e) => {
                    let _ = tx.send(e.to_listener_frame());
                }
            }
        }
        ClientFrame::LeaveSession { .. } => {
            if let Some(session_id) = app_state.registry.remove_listener(socket_id) {
                info!("listener {} left session {}", socket_id, session_id);
                notify_operator_roster_changed(app_state, &session_id);
            }
        }
        ClientFrame::Heartbeat => {
            app_state.registry.touch_listener(socket_id);
            let _ = tx.send(ServerFrame::Heartbeat);
        }
        other => {
            debug!(
                "listener {} sent operator frame {}",
                socket_id,
                super::frame_name(&other)
            );
            let _ = tx.send(
                HubError::OperationNotAllowed("operator frame on a listener connection".to_string())
                    .to_listener_frame(),
            );
        }
    }
}

fn handle_join(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    session_id: &str,
    preferred_language: Language,
    capabilities: ListenerCapabilities,
) {
    match app_state
        .registry
        .add_listener(session_id, socket_id, preferred_language, capabilities)
    {
        Ok(session) => {
            info!(
                "listener {} joined {} ({})",
                socket_id, session_id, preferred_language
            );
            let _ = tx.send(ServerFrame::SessionMetadata {
                session_id: session_id.to_string(),
                config: session.config.clone(),
                status: session.status,
                tts_available: session.tts_available() && app_state.tts.provider_configured(),
                timestamp: now_iso(),
            });
            notify_operator_roster_changed(app_state, session_id);
        }
        Err(e) => {
            let _ = tx.send(e.to_listener_frame());
        }
    }
}

/// Push the audience digest to the session's operator socket, if one is
/// currently bound.
pub(super) fn notify_operator_roster_changed(app_state: &AppState, session_id: &str) {
    let Some(session) = app_state.registry.get(session_id) else {
        return;
    };
    let Some(operator_socket) = session.current_admin_socket else {
        return;
    };

    let counts = app_state.registry.listener_counts(session_id);
    let total = counts.values().sum();
    app_state.connections.send_to(
        operator_socket,
        ServerFrame::SessionMetadataUpdate {
            session_id: session_id.to_string(),
            listener_counts: counts,
            total_listeners: total,
            timestamp: now_iso(),
        },
    );
}
