mod audio_cache;
mod cognito;
mod config;
mod error;
mod handlers;
mod identity_store;
mod maintenance;
mod registry;
mod security;
mod tts;

use axum::routing::get;
use axum::Router;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audio_cache::AudioCache;
use crate::cognito::{CognitoVerifier, IdentityProvider};
use crate::config::Config;
use crate::handlers::websocket::{announce_shutdown, ConnectionManager};
use crate::identity_store::AdminIdentityStore;
use crate::registry::SessionRegistry;
use crate::security::{AuditLog, RateLimiter};
use crate::tts::{PollySynthesizer, TtsEngine};

pub struct AppState {
    pub config: Config,
    pub identity: Arc<dyn IdentityProvider>,
    pub identity_store: AdminIdentityStore,
    pub registry: SessionRegistry,
    pub tts: TtsEngine,
    pub audio_cache: AudioCache,
    pub limiter: RateLimiter,
    pub audit: AuditLog,
    pub connections: ConnectionManager,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Environment first, so RUST_LOG from .env reaches the subscriber.
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // The only configuration failure that exits non-zero: required
            // identity provider coordinates are absent.
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let identity: Arc<dyn IdentityProvider> = Arc::new(CognitoVerifier::new(&config).await);

    let identity_store = AdminIdentityStore::load(&config.admin_identities_dir).await?;
    let registry =
        SessionRegistry::load(&config.session_persistence_dir, config.max_clients_per_session)
            .await?;

    let tts = if config.enable_tts {
        info!("TTS enabled (region {})", config.tts_region);
        TtsEngine::new(
            Some(Arc::new(PollySynthesizer::new(&config.tts_region).await)),
            config.tts_timeout,
            config.tts_max_attempts,
        )
    } else {
        info!("TTS disabled, broadcasts will carry text-only directives");
        TtsEngine::disabled()
    };

    let audio_cache = AudioCache::new(
        &config.public_url,
        config.audio_cache_max_bytes,
        config.audio_cache_max_entries,
        config.audio_cache_idle,
        config.audio_cache_dir.clone(),
    )
    .await?;

    let limiter = RateLimiter::new(
        config.admin_auth_rate_limit_per_minute,
        config.ws_rate_limit_per_second,
        config.admin_lockout_threshold,
        config.admin_lockout_duration,
    );

    let addr = format!("{}:{}", config.host, config.port);
    let drain_deadline = config.shutdown_drain;

    let app_state = Arc::new(AppState {
        identity,
        identity_store,
        registry,
        tts,
        audio_cache,
        limiter,
        audit: AuditLog::new(),
        connections: ConnectionManager::new(),
        started_at: Instant::now(),
        config,
    });

    let shutdown = CancellationToken::new();
    let maintenance_handles = maintenance::spawn_loops(app_state.clone(), shutdown.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(handlers::websocket::handle_hub_websocket))
        .route("/audio/:file", get(handlers::http::serve_audio))
        .route("/health", get(handlers::http::health))
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        result = serve.into_future() => {
            result?;
        }
        _ = shutdown_flow(app_state.clone(), shutdown.clone(), drain_deadline) => {}
    }

    for handle in maintenance_handles {
        handle.abort();
    }
    info!("shutdown complete");
    Ok(())
}

/// Graceful shutdown: stop maintenance, tell every connection, then wait for
/// sockets to drain up to the configured deadline.
async fn shutdown_flow(
    app_state: Arc<AppState>,
    shutdown: CancellationToken,
    drain_deadline: Duration,
) {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install the shutdown signal handler");
        return;
    }

    info!("shutdown signal received");
    shutdown.cancel();
    announce_shutdown(&app_state.connections, "server shutting down");

    let deadline = Instant::now() + drain_deadline;
    while !app_state.connections.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    info!(
        "drained, {} connections remaining at deadline",
        app_state.connections.len()
    );
}

#[cfg(test)]
pub mod test_support {
    //! Shared fixtures: a fully wired AppState over fakes and tempdirs.

    use super::*;
    use crate::cognito::test_support::FakeIdentityProvider;
    use crate::tts::test_support::FlakySynthesizer;
    use shared::ServerFrame;
    use tokio::sync::mpsc;

    #[derive(Default)]
    pub struct StateOptions {
        /// How many provider synthesis calls fail before succeeding.
        pub provider_failures: u32,
    }

    pub async fn test_state(options: StateOptions) -> Arc<AppState> {
        // Tempdirs live as long as the process; tests are short-lived.
        let admin_dir = tempfile::tempdir().unwrap().into_path();
        let session_dir = tempfile::tempdir().unwrap().into_path();

        let identity: Arc<dyn IdentityProvider> = Arc::new(
            FakeIdentityProvider::new()
                .with_user("alice@example.com", "p@ss", "alice-sub")
                .with_user("bob@example.com", "hunter2", "bob-sub"),
        );

        let config = Config::for_tests(admin_dir.clone(), session_dir.clone());

        Arc::new(AppState {
            identity,
            identity_store: AdminIdentityStore::load(&admin_dir).await.unwrap(),
            registry: SessionRegistry::load(&session_dir, config.max_clients_per_session)
                .await
                .unwrap(),
            tts: TtsEngine::new(
                Some(Arc::new(FlakySynthesizer::failing(options.provider_failures))),
                Duration::from_secs(1),
                1,
            ),
            audio_cache: AudioCache::new(
                &config.public_url,
                config.audio_cache_max_bytes,
                config.audio_cache_max_entries,
                config.audio_cache_idle,
                None,
            )
            .await
            .unwrap(),
            limiter: RateLimiter::new(
                config.admin_auth_rate_limit_per_minute,
                config.ws_rate_limit_per_second,
                config.admin_lockout_threshold,
                config.admin_lockout_duration,
            ),
            audit: AuditLog::new(),
            connections: ConnectionManager::new(),
            started_at: Instant::now(),
            config,
        })
    }

    /// Collect everything currently queued on a frame channel.
    pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
