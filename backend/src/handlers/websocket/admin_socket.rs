//! Operator connection lifecycle and frame handling.
//!
//! A socket lands here after its first `admin-auth` frame. Until
//! authentication succeeds only further `admin-auth` attempts (and
//! heartbeats) are accepted, bounded by the grace window. Once a subject is
//! bound to the socket, every operator frame is dispatched from the loop at
//! the bottom; frames arrive and are processed strictly in order.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{broadcast, frame_name, FrameSender};
use crate::error::{HubError, HubResult};
use crate::security::AuditKind;
use crate::AppState;
use shared::{
    now_iso, AccessMode, AuthMethod, ClientFrame, ErrorDetails, Language, LanguageAction,
    Permissions, ServerFrame, SessionFilter, SessionStatus, SessionSummary, SocketId, TtsMode,
};

#[derive(Debug)]
struct AdminContext {
    admin_id: String,
    username: String,
}

pub(super) async fn run(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    receiver: &mut SplitStream<WebSocket>,
    addr: SocketAddr,
    first_frame: ClientFrame,
) {
    let Some(mut ctx) = authenticate_loop(app_state, socket_id, tx, receiver, addr, first_frame).await
    else {
        return;
    };

    info!(
        "operator {} ({}) bound to socket {}",
        ctx.username, ctx.admin_id, socket_id
    );

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("operator {} sent undecodable frame: {}", ctx.admin_id, e);
                        send_error(
                            tx,
                            &HubError::InvalidInput("unrecognized frame".to_string()),
                            "unknown",
                            None,
                            &ctx.admin_id,
                        );
                        continue;
                    }
                };
                handle_frame(app_state, socket_id, tx, addr, &mut ctx, frame).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("operator socket {} error: {}", socket_id, e);
                break;
            }
            _ => {}
        }
    }

    // Owned sessions survive the disconnect; only the advisory socket
    // binding is cleared (by the shared cleanup in mod.rs).
    info!("operator {} disconnected from socket {}", ctx.admin_id, socket_id);
}

async fn authenticate_loop(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    receiver: &mut SplitStream<WebSocket>,
    addr: SocketAddr,
    first_frame: ClientFrame,
) -> Option<AdminContext> {
    let deadline = Instant::now() + app_state.config.auth_grace_window;
    let mut pending = Some(first_frame);

    loop {
        if let Some(frame) = pending.take() {
            if let ClientFrame::AdminAuth {
                method,
                username,
                password,
                token,
            } = frame
            {
                match handle_admin_auth(app_state, socket_id, tx, addr, method, username, password, token)
                    .await
                {
                    Ok(ctx) => return Some(ctx),
                    Err(e) => {
                        send_error(tx, &e, "admin-auth", None, "");
                    }
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("socket {} failed to authenticate within the grace window", socket_id);
            return None;
        }

        match tokio::time::timeout(remaining, receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame @ ClientFrame::AdminAuth { .. }) => pending = Some(frame),
                Ok(ClientFrame::Heartbeat) => {
                    let _ = tx.send(ServerFrame::Heartbeat);
                }
                Ok(other) => {
                    send_error(
                        tx,
                        &HubError::AccessDenied,
                        frame_name(&other),
                        None,
                        "",
                    );
                }
                Err(_) => {}
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(_))) => {}
            Err(_) => continue,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_admin_auth(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    addr: SocketAddr,
    method: AuthMethod,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
) -> HubResult<AdminContext> {
    if let Err(e) = app_state.limiter.check_auth_attempt(addr.ip()) {
        app_state.audit.record(
            AuditKind::RateLimited,
            username.as_deref().unwrap_or("unknown"),
            "admin-auth",
            "auth attempt limit",
        );
        return Err(e);
    }

    let (identity, tokens) = match method {
        AuthMethod::Credentials => {
            let username = username.ok_or(HubError::MissingField("username"))?;
            let password = password.ok_or(HubError::MissingField("password"))?;

            match app_state
                .identity
                .authenticate_credentials(&username, &password)
                .await
            {
                Ok((identity, tokens)) => {
                    app_state.limiter.record_auth_success(addr.ip());
                    (identity, Some(tokens))
                }
                Err(e) => {
                    app_state.limiter.record_auth_failure(addr.ip());
                    app_state.audit.record(
                        AuditKind::AuthFailure,
                        &username,
                        "admin-auth",
                        &e.to_string(),
                    );
                    return Err(e);
                }
            }
        }
        AuthMethod::Token => {
            let token = token.ok_or(HubError::MissingField("token"))?;
            match app_state.identity.validate_access_token(&token).await {
                Ok(identity) => {
                    app_state.limiter.record_auth_success(addr.ip());
                    (identity, None)
                }
                Err(e) => {
                    app_state.limiter.record_auth_failure(addr.ip());
                    app_state.audit.record(
                        AuditKind::TokenRejected,
                        "unknown",
                        "admin-auth",
                        &e.to_string(),
                    );
                    return Err(e);
                }
            }
        }
    };

    let record = app_state
        .identity_store
        .get_or_create_from_provider(&identity)
        .await?;
    app_state
        .identity_store
        .add_active_socket(&record.admin_id, socket_id);
    app_state.audit.record(
        AuditKind::AuthSuccess,
        &record.admin_id,
        "admin-auth",
        match method {
            AuthMethod::Credentials => "credentials",
            AuthMethod::Token => "token",
        },
    );

    // Re-bind any still-active owned sessions to this socket.
    let mut recovered: Vec<String> = Vec::new();
    for session in app_state.registry.list_owned_by(&record.admin_id) {
        if session.status == SessionStatus::Active {
            app_state
                .registry
                .update_current_admin_socket(&session.session_id, Some(socket_id));
            recovered.push(session.session_id);
        }
    }

    if let Some(tokens) = &tokens {
        schedule_expiry_warning(app_state, tx.clone(), tokens.expires_in);
    }

    let _ = tx.send(ServerFrame::AdminAuthResponse {
        success: true,
        admin_id: record.admin_id.clone(),
        username: record.username.clone(),
        email: record.email.clone(),
        tokens,
        owned_sessions: summaries(app_state, &record.admin_id, SessionFilter::Owned),
        all_sessions: summaries(app_state, &record.admin_id, SessionFilter::All),
        permissions: Permissions::default(),
        timestamp: now_iso(),
    });

    if method == AuthMethod::Token && !recovered.is_empty() {
        let _ = tx.send(ServerFrame::AdminReconnection {
            recovered_sessions: recovered,
            timestamp: now_iso(),
        });
    }

    Ok(AdminContext {
        admin_id: record.admin_id,
        username: record.username,
    })
}

/// One-shot advisory ahead of access-token expiry. Best-effort: if the
/// socket is gone by then, the send just fails.
fn schedule_expiry_warning(app_state: &AppState, tx: FrameSender, expires_in: i64) {
    let lead = app_state.config.token_expiry_warning;
    let Ok(expires_in) = u64::try_from(expires_in) else { return };
    let delay = std::time::Duration::from_secs(expires_in).saturating_sub(lead);

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(ServerFrame::TokenExpiryWarning {
            expires_in_secs: lead.as_secs().min(expires_in),
            timestamp: now_iso(),
        });
    });
}

/// The session a frame operates on, for error details. Frames that carry no
/// session id scope to nothing.
fn frame_session_id(frame: &ClientFrame) -> Option<&str> {
    match frame {
        ClientFrame::StartSession { session_id, .. }
        | ClientFrame::EndSession { session_id }
        | ClientFrame::UpdateSessionConfig { session_id, .. }
        | ClientFrame::AdminSessionAccess { session_id, .. }
        | ClientFrame::BroadcastTranslation { session_id, .. }
        | ClientFrame::GenerateTts { session_id, .. }
        | ClientFrame::TtsConfigUpdate { session_id, .. }
        | ClientFrame::LanguageUpdate { session_id, .. }
        | ClientFrame::JoinSession { session_id, .. } => Some(session_id),
        _ => None,
    }
}

async fn handle_frame(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    addr: SocketAddr,
    ctx: &mut AdminContext,
    frame: ClientFrame,
) {
    let operation = frame_name(&frame);
    let scope = frame_session_id(&frame).map(str::to_string);

    match frame {
        ClientFrame::Heartbeat => {
            app_state.identity_store.touch(&ctx.admin_id);
            let _ = tx.send(ServerFrame::Heartbeat);
            return;
        }
        ClientFrame::AdminAuth {
            method,
            username,
            password,
            token,
        } => {
            // Re-authentication rebinds the socket (e.g. after a token swap).
            match handle_admin_auth(app_state, socket_id, tx, addr, method, username, password, token)
                .await
            {
                Ok(new_ctx) => *ctx = new_ctx,
                Err(e) => send_error(tx, &e, operation, None, &ctx.admin_id),
            }
            return;
        }
        _ => {}
    }

    // Everything below is an authenticated operation: rate-limited per
    // subject and operation.
    if let Err(e) = app_state.limiter.check_operation(&ctx.admin_id, operation) {
        app_state
            .audit
            .record(AuditKind::RateLimited, &ctx.admin_id, operation, "operation limit");
        send_error(tx, &e, operation, scope.as_deref(), &ctx.admin_id);
        return;
    }

    let result = match frame {
        ClientFrame::TokenRefresh {
            username,
            refresh_token,
        } => handle_token_refresh(app_state, tx, ctx, &username, &refresh_token).await,
        ClientFrame::StartSession {
            session_id,
            config,
            created_by,
        } => handle_start_session(app_state, socket_id, tx, ctx, &session_id, config, created_by).await,
        ClientFrame::EndSession { session_id } => {
            handle_end_session(app_state, tx, ctx, &session_id, "ended by operator").await
        }
        ClientFrame::UpdateSessionConfig { session_id, config } => {
            handle_update_config(app_state, tx, ctx, &session_id, config).await
        }
        ClientFrame::ListSessions { filter } => {
            let _ = tx.send(ServerFrame::ListSessionsResponse {
                sessions: summaries(app_state, &ctx.admin_id, filter),
                timestamp: now_iso(),
            });
            Ok(())
        }
        ClientFrame::AdminSessionAccess { session_id, mode } => {
            handle_session_access(app_state, tx, ctx, &session_id, mode)
        }
        ClientFrame::BroadcastTranslation {
            session_id,
            source_text,
            translations,
            generate_tts,
            voice_tier,
        } => {
            broadcast::handle_broadcast(
                app_state,
                tx,
                &ctx.admin_id,
                &session_id,
                &source_text,
                translations,
                generate_tts,
                voice_tier,
            )
            .await
        }
        ClientFrame::GenerateTts {
            session_id,
            text,
            language,
            voice_tier,
        } => handle_generate_tts(app_state, tx, ctx, &session_id, &text, language, voice_tier).await,
        ClientFrame::TtsConfigUpdate {
            session_id,
            tts_mode,
            audio_quality,
        } => handle_tts_config_update(app_state, tx, ctx, &session_id, tts_mode, audio_quality).await,
        ClientFrame::LanguageUpdate {
            session_id,
            language,
            action,
        } => handle_language_update(app_state, tx, ctx, &session_id, language, action).await,
        ClientFrame::JoinSession { .. }
        | ClientFrame::LeaveSession { .. }
        | ClientFrame::ChangeLanguage { .. } => Err(HubError::OperationNotAllowed(
            "listener frame on an operator connection".to_string(),
        )),
        ClientFrame::AdminAuth { .. } | ClientFrame::Heartbeat => unreachable!(),
    };

    if let Err(e) = result {
        send_error(tx, &e, operation, scope.as_deref(), &ctx.admin_id);
    }
}

async fn handle_token_refresh(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    username: &str,
    refresh_token: &str,
) -> HubResult<()> {
    let refreshed = app_state
        .identity
        .refresh_access_token(username, refresh_token)
        .await?;

    app_state
        .audit
        .record(AuditKind::TokenRefreshed, &ctx.admin_id, "token-refresh", "ok");
    schedule_expiry_warning(app_state, tx.clone(), refreshed.expires_in);

    let _ = tx.send(ServerFrame::TokenRefreshResponse {
        success: true,
        access_token: refreshed.access_token,
        expires_in: refreshed.expires_in,
        timestamp: now_iso(),
    });
    Ok(())
}

async fn handle_start_session(
    app_state: &AppState,
    socket_id: SocketId,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    config: shared::SessionConfig,
    created_by: Option<String>,
) -> HubResult<()> {
    let created_by = created_by.unwrap_or_else(|| ctx.username.clone());
    let session = app_state
        .registry
        .create(session_id, config, &ctx.admin_id, socket_id, &created_by)
        .await?;

    if let Err(e) = app_state
        .identity_store
        .add_owned_session(&ctx.admin_id, session_id)
        .await
    {
        // Ownership must be recorded on both sides; undo the half-created
        // session and report a retryable failure.
        error!("failed to record ownership of {}: {}", session_id, e);
        let _ = app_state.registry.delete(session_id).await;
        return Err(HubError::SessionCreationFailed(e.to_string()));
    }

    let _ = tx.send(ServerFrame::StartSessionResponse {
        success: true,
        session: session.to_summary(&ctx.admin_id),
        timestamp: now_iso(),
    });
    Ok(())
}

async fn handle_end_session(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    reason: &str,
) -> HubResult<()> {
    verify_write_access(app_state, &ctx.admin_id, session_id, "end-session")?;

    let listeners = app_state.registry.end(session_id).await?;
    for socket in listeners {
        app_state.connections.send_to(
            socket,
            ServerFrame::SessionEnded {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
                timestamp: now_iso(),
            },
        );
    }

    app_state
        .identity_store
        .remove_owned_session(&ctx.admin_id, session_id)
        .await?;

    let _ = tx.send(ServerFrame::EndSessionResponse {
        success: true,
        session_id: session_id.to_string(),
        timestamp: now_iso(),
    });
    Ok(())
}

async fn handle_update_config(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    config: shared::SessionConfig,
) -> HubResult<()> {
    verify_write_access(app_state, &ctx.admin_id, session_id, "update-session-config")?;

    let outcome = app_state.registry.update_config(session_id, config).await?;
    notify_config_change(app_state, session_id, &outcome);

    let _ = tx.send(ServerFrame::UpdateSessionConfigResponse {
        success: true,
        session_id: session_id.to_string(),
        config: outcome.config,
        removed_languages: outcome.removed_languages,
        timestamp: now_iso(),
    });
    Ok(())
}

/// Push language-removed notices to displaced listeners and the new config
/// to everyone still in the roster.
fn notify_config_change(
    app_state: &AppState,
    session_id: &str,
    outcome: &crate::registry::ConfigUpdateOutcome,
) {
    for (socket, language) in &outcome.displaced_listeners {
        app_state.connections.send_to(
            *socket,
            ServerFrame::LanguageRemoved {
                session_id: session_id.to_string(),
                language: *language,
                remaining_languages: outcome.config.enabled_languages.clone(),
                timestamp: now_iso(),
            },
        );
    }

    for (socket, _) in app_state.registry.roster_snapshot(session_id) {
        app_state.connections.send_to(
            socket,
            ServerFrame::ConfigUpdated {
                session_id: session_id.to_string(),
                config: outcome.config.clone(),
                timestamp: now_iso(),
            },
        );
    }
}

fn handle_session_access(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    mode: AccessMode,
) -> HubResult<()> {
    let session = app_state
        .registry
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;

    if mode == AccessMode::Write {
        verify_write_access(app_state, &ctx.admin_id, session_id, "admin-session-access")?;
    }

    let _ = tx.send(ServerFrame::ListSessionsResponse {
        sessions: vec![session.to_summary(&ctx.admin_id)],
        timestamp: now_iso(),
    });
    Ok(())
}

async fn handle_generate_tts(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    text: &str,
    language: Language,
    voice_tier: Option<TtsMode>,
) -> HubResult<()> {
    verify_write_access(app_state, &ctx.admin_id, session_id, "generate-tts")?;

    let session = app_state
        .registry
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
    if !session.tts_available() {
        return Err(HubError::OperationNotAllowed(
            "tts is disabled for this session".to_string(),
        ));
    }

    let mode = voice_tier.unwrap_or(session.config.tts_mode);
    let result = broadcast::synthesize_with_cache(
        app_state,
        text,
        language,
        mode,
        session.config.audio_quality,
    )
    .await?;

    let _ = tx.send(ServerFrame::GenerateTtsResponse {
        success: true,
        tier: result.tier,
        audio_url: result.audio.as_ref().map(|a| a.url.clone()),
        audio: result.audio.map(|a| a.metadata),
        timestamp: now_iso(),
    });
    Ok(())
}

async fn handle_tts_config_update(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    tts_mode: TtsMode,
    audio_quality: Option<shared::AudioQuality>,
) -> HubResult<()> {
    verify_write_access(app_state, &ctx.admin_id, session_id, "tts-config-update")?;

    let session = app_state
        .registry
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;

    let mut config = session.config;
    config.tts_mode = tts_mode;
    if let Some(quality) = audio_quality {
        config.audio_quality = quality;
    }

    let outcome = app_state.registry.update_config(session_id, config).await?;
    notify_config_change(app_state, session_id, &outcome);

    let _ = tx.send(ServerFrame::TtsConfigUpdate {
        session_id: session_id.to_string(),
        tts_mode: outcome.config.tts_mode,
        audio_quality: outcome.config.audio_quality,
        timestamp: now_iso(),
    });
    Ok(())
}

async fn handle_language_update(
    app_state: &AppState,
    tx: &FrameSender,
    ctx: &AdminContext,
    session_id: &str,
    language: Language,
    action: LanguageAction,
) -> HubResult<()> {
    verify_write_access(app_state, &ctx.admin_id, session_id, "language-update")?;

    let session = app_state
        .registry
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;

    let mut config = session.config;
    match action {
        LanguageAction::Add => {
            if !config.enabled_languages.contains(&language) {
                config.enabled_languages.push(language);
            }
        }
        LanguageAction::Remove => {
            config.enabled_languages.retain(|l| *l != language);
        }
    }

    let outcome = app_state.registry.update_config(session_id, config).await?;
    notify_config_change(app_state, session_id, &outcome);

    let _ = tx.send(ServerFrame::UpdateSessionConfigResponse {
        success: true,
        session_id: session_id.to_string(),
        config: outcome.config,
        removed_languages: outcome.removed_languages,
        timestamp: now_iso(),
    });
    Ok(())
}

/// Owner-only gate used by every write operation; violations are audited.
pub(super) fn verify_write_access(
    app_state: &AppState,
    admin_id: &str,
    session_id: &str,
    operation: &str,
) -> HubResult<()> {
    if app_state.registry.get(session_id).is_none() {
        return Err(HubError::SessionNotFound(session_id.to_string()));
    }
    if !app_state
        .registry
        .verify_access(session_id, admin_id, AccessMode::Write)
    {
        app_state.audit.record(
            AuditKind::OwnershipViolation,
            admin_id,
            operation,
            session_id,
        );
        return Err(HubError::SessionNotOwned(session_id.to_string()));
    }
    Ok(())
}

fn summaries(app_state: &AppState, admin_id: &str, filter: SessionFilter) -> Vec<SessionSummary> {
    let sessions = match filter {
        SessionFilter::All => app_state.registry.list(),
        SessionFilter::Owned => app_state.registry.list_owned_by(admin_id),
    };
    let mut summaries: Vec<SessionSummary> =
        sessions.iter().map(|s| s.to_summary(admin_id)).collect();
    summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    summaries
}

fn send_error(
    tx: &FrameSender,
    err: &HubError,
    operation: &str,
    session_id: Option<&str>,
    admin_id: &str,
) {
    warn!("operator operation {} failed: {}", operation, err);

    let validation_errors = match err {
        HubError::InvalidInput(detail) | HubError::InvalidConfig(detail) => vec![detail.clone()],
        HubError::MissingField(field) => vec![format!("missing required field {}", field)],
        _ => Vec::new(),
    };

    let _ = tx.send(err.to_admin_frame(ErrorDetails {
        session_id: session_id.map(str::to_string),
        admin_id: (!admin_id.is_empty()).then(|| admin_id.to_string()),
        operation: Some(operation.to_string()),
        validation_errors,
    }));
}
