//! Wall-clock maintenance loops.
//!
//! Each loop runs on its own interval and stops at the next safe point when
//! the shutdown token fires: admin identity cleanup, the session sweep
//! (orphans, idle timeouts, ended-session deletion), the audio cache sweep,
//! and trimming of the audit ring and rate-limit windows.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::AppState;
use shared::{now_iso, ServerFrame};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const SECURITY_TRIM_INTERVAL: Duration = Duration::from_secs(3600);
const AUDIT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

pub fn spawn_loops(app_state: Arc<AppState>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if app_state.config.admin_identity_cleanup_enabled {
        let state = app_state.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = make_interval(state.config.admin_identity_cleanup_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = state
                            .identity_store
                            .cleanup(state.config.admin_identity_retention)
                            .await;
                        if !removed.is_empty() {
                            info!("identity cleanup removed {} idle admins", removed.len());
                        }
                    }
                }
            }
        }));
    } else {
        info!("admin identity cleanup is disabled by configuration");
    }

    if app_state.config.session_cleanup_enabled {
        let state = app_state.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = make_interval(state.config.session_cleanup_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => session_sweep(&state).await,
                }
            }
        }));
    } else {
        info!("session cleanup is disabled by configuration");
    }

    {
        let state = app_state.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = make_interval(CACHE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => state.audio_cache.sweep().await,
                }
            }
        }));
    }

    {
        let state = app_state;
        let token = shutdown;
        handles.push(tokio::spawn(async move {
            let mut interval = make_interval(SECURITY_TRIM_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        state.audit.trim_older_than(AUDIT_MAX_AGE);
                        state.limiter.prune();
                    }
                }
            }
        }));
    }

    handles
}

/// Interval that skips its immediate first tick so startup stays quiet.
fn make_interval(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// One pass over the session directory: end orphaned and idle sessions,
/// delete what has already ended.
async fn session_sweep(app_state: &AppState) {
    let candidates = app_state.registry.sweep_candidates(
        |admin_id| app_state.identity_store.exists(admin_id),
        app_state.config.session_timeout,
    );

    for (session_id, reason) in candidates
        .orphaned
        .iter()
        .map(|s| (s, "session owner no longer exists"))
        .chain(candidates.idle.iter().map(|s| (s, "session timed out")))
    {
        warn!("maintenance ending session {}: {}", session_id, reason);
        end_session_for_maintenance(app_state, session_id, reason).await;
    }

    for session_id in &candidates.ended {
        if let Err(e) = app_state.registry.delete(session_id).await {
            error!("failed to delete ended session {}: {}", session_id, e);
        }
    }
}

/// End a session on the hub's own authority (orphan or timeout), notifying
/// whoever is still listening.
pub async fn end_session_for_maintenance(app_state: &AppState, session_id: &str, reason: &str) {
    let owner = app_state.registry.get(session_id).map(|s| s.admin_id);

    match app_state.registry.end(session_id).await {
        Ok(listeners) => {
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
        }
        Err(e) => {
            error!("maintenance failed to end session {}: {}", session_id, e);
            return;
        }
    }

    if let Some(admin_id) = owner {
        if app_state.identity_store.exists(&admin_id) {
            if let Err(e) = app_state
                .identity_store
                .remove_owned_session(&admin_id, session_id)
                .await
            {
                error!(
                    "failed to release ownership of {} from {}: {}",
                    session_id, admin_id, e
                );
            }
        }
    }
}
