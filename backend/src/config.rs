//! Environment configuration.
//!
//! Everything is read once at startup. The three Cognito coordinates are
//! required and fail-fast: a missing one is collected (not short-circuited)
//! so the startup error names every absent variable at once. Optional values
//! fall back to documented defaults; unparseable optional values warn and
//! fall back rather than aborting.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Variables this server actually reads. Anything else in our namespaces is
/// reported as set-but-unused at startup.
const KNOWN_VARS: &[&str] = &[
    "COGNITO_REGION",
    "COGNITO_USER_POOL_ID",
    "COGNITO_CLIENT_ID",
    "PORT",
    "HOST",
    "PUBLIC_URL",
    "ADMIN_IDENTITIES_DIR",
    "SESSION_PERSISTENCE_DIR",
    "ENABLE_TTS",
    "TTS_REGION",
    "TTS_TIMEOUT_MS",
    "TTS_MAX_ATTEMPTS",
    "AUDIO_CACHE_DIR",
    "AUDIO_CACHE_MAX_BYTES",
    "AUDIO_CACHE_MAX_ENTRIES",
    "AUDIO_CACHE_IDLE_SECS",
    "WEBSOCKET_RATE_LIMIT_PER_SECOND",
    "MAX_CLIENTS_PER_SESSION",
    "SESSION_TIMEOUT_MINUTES",
    "ADMIN_AUTH_RATE_LIMIT_PER_MINUTE",
    "ADMIN_LOCKOUT_DURATION_MS",
    "ADMIN_LOCKOUT_THRESHOLD",
    "ADMIN_IDENTITY_RETENTION_DAYS",
    "ADMIN_IDENTITY_CLEANUP_INTERVAL_MS",
    "ADMIN_IDENTITY_CLEANUP_ENABLED",
    "SESSION_CLEANUP_ENABLED",
    "SESSION_CLEANUP_INTERVAL_MS",
    "AUTH_GRACE_WINDOW_SECS",
    "TOKEN_EXPIRY_WARNING_SECS",
    "BROADCAST_SYNTHESIS_CONCURRENCY",
    "SHUTDOWN_DRAIN_SECS",
];

const OWNED_PREFIXES: &[&str] = &[
    "COGNITO_",
    "ADMIN_",
    "SESSION_",
    "TTS_",
    "AUDIO_CACHE_",
    "WEBSOCKET_",
    "BROADCAST_",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Config {
    // Identity provider coordinates (required)
    pub cognito_region: String,
    pub cognito_user_pool_id: String,
    pub cognito_client_id: String,

    // Server
    pub host: String,
    pub port: u16,
    pub public_url: String,

    // Persistence
    pub admin_identities_dir: PathBuf,
    pub session_persistence_dir: PathBuf,

    // TTS
    pub enable_tts: bool,
    pub tts_region: String,
    pub tts_timeout: Duration,
    pub tts_max_attempts: u32,

    // Audio cache
    pub audio_cache_dir: Option<PathBuf>,
    pub audio_cache_max_bytes: u64,
    pub audio_cache_max_entries: usize,
    pub audio_cache_idle: Duration,

    // Limits
    pub ws_rate_limit_per_second: u32,
    pub max_clients_per_session: usize,
    pub session_timeout: Duration,
    pub admin_auth_rate_limit_per_minute: u32,
    pub admin_lockout_duration: Duration,
    pub admin_lockout_threshold: u32,

    // Maintenance
    pub admin_identity_retention: Duration,
    pub admin_identity_cleanup_interval: Duration,
    pub admin_identity_cleanup_enabled: bool,
    pub session_cleanup_enabled: bool,
    pub session_cleanup_interval: Duration,

    // Protocol timing
    pub auth_grace_window: Duration,
    pub token_expiry_warning: Duration,
    pub broadcast_synthesis_concurrency: usize,
    pub shutdown_drain: Duration,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut missing = Vec::new();
        let mut required = |name: &str| match env::var(name) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                missing.push(name.to_string());
                String::new()
            }
        };

        let cognito_region = required("COGNITO_REGION");
        let cognito_user_pool_id = required("COGNITO_USER_POOL_ID");
        let cognito_client_id = required("COGNITO_CLIENT_ID");

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port = parsed("PORT", 3001u16);
        let public_url =
            env::var("PUBLIC_URL").unwrap_or_else(|_| format!("http://localhost:{}", port));

        let config = Config {
            tts_region: env::var("TTS_REGION").unwrap_or_else(|_| cognito_region.clone()),
            cognito_region,
            cognito_user_pool_id,
            cognito_client_id,

            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            public_url,

            admin_identities_dir: env::var("ADMIN_IDENTITIES_DIR")
                .unwrap_or_else(|_| "./admin-identities".to_string())
                .into(),
            session_persistence_dir: env::var("SESSION_PERSISTENCE_DIR")
                .unwrap_or_else(|_| "./sessions".to_string())
                .into(),

            enable_tts: parsed_bool("ENABLE_TTS", false),
            tts_timeout: Duration::from_millis(parsed("TTS_TIMEOUT_MS", 5000u64)),
            tts_max_attempts: parsed("TTS_MAX_ATTEMPTS", 2u32),

            audio_cache_dir: env::var("AUDIO_CACHE_DIR").ok().map(PathBuf::from),
            audio_cache_max_bytes: parsed("AUDIO_CACHE_MAX_BYTES", 104_857_600u64),
            audio_cache_max_entries: parsed("AUDIO_CACHE_MAX_ENTRIES", 2048usize),
            audio_cache_idle: Duration::from_secs(parsed("AUDIO_CACHE_IDLE_SECS", 3600u64)),

            ws_rate_limit_per_second: parsed("WEBSOCKET_RATE_LIMIT_PER_SECOND", 10u32),
            max_clients_per_session: parsed("MAX_CLIENTS_PER_SESSION", 50usize),
            session_timeout: Duration::from_secs(
                parsed("SESSION_TIMEOUT_MINUTES", 480u64) * 60,
            ),
            admin_auth_rate_limit_per_minute: parsed("ADMIN_AUTH_RATE_LIMIT_PER_MINUTE", 5u32),
            admin_lockout_duration: Duration::from_millis(parsed(
                "ADMIN_LOCKOUT_DURATION_MS",
                900_000u64,
            )),
            admin_lockout_threshold: parsed("ADMIN_LOCKOUT_THRESHOLD", 10u32),

            admin_identity_retention: Duration::from_secs(
                parsed("ADMIN_IDENTITY_RETENTION_DAYS", 90u64) * 24 * 3600,
            ),
            admin_identity_cleanup_interval: Duration::from_millis(parsed(
                "ADMIN_IDENTITY_CLEANUP_INTERVAL_MS",
                86_400_000u64,
            )),
            admin_identity_cleanup_enabled: parsed_bool("ADMIN_IDENTITY_CLEANUP_ENABLED", true),
            session_cleanup_enabled: parsed_bool("SESSION_CLEANUP_ENABLED", true),
            session_cleanup_interval: Duration::from_millis(parsed(
                "SESSION_CLEANUP_INTERVAL_MS",
                3_600_000u64,
            )),

            auth_grace_window: Duration::from_secs(parsed("AUTH_GRACE_WINDOW_SECS", 30u64)),
            token_expiry_warning: Duration::from_secs(parsed("TOKEN_EXPIRY_WARNING_SECS", 300u64)),
            broadcast_synthesis_concurrency: parsed("BROADCAST_SYNTHESIS_CONCURRENCY", 4usize)
                .max(1),
            shutdown_drain: Duration::from_secs(parsed("SHUTDOWN_DRAIN_SECS", 10u64)),
        };

        warn_unused_vars();

        Ok(config)
    }
}

/// Parse an optional variable, warning and defaulting on garbage. Only the
/// required Cognito coordinates may abort startup.
fn parsed<T: FromStr + std::fmt::Display + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("{}={:?} is not valid, using default {}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn parsed_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!("{}={:?} is not a boolean, using default {}", name, other, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn warn_unused_vars() {
    for (name, _) in env::vars() {
        if OWNED_PREFIXES.iter().any(|p| name.starts_with(p))
            && !KNOWN_VARS.contains(&name.as_str())
        {
            warn!("environment variable {} is set but not used by this server", name);
        }
    }
}

#[cfg(test)]
impl Config {
    /// Fixture config pointing at caller-supplied tempdirs; values mirror
    /// the documented defaults except where tests need speed.
    pub fn for_tests(admin_identities_dir: PathBuf, session_persistence_dir: PathBuf) -> Self {
        Config {
            cognito_region: "us-east-1".to_string(),
            cognito_user_pool_id: "us-east-1_TestPool".to_string(),
            cognito_client_id: "test-client".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3001,
            public_url: "http://localhost:3001".to_string(),
            admin_identities_dir,
            session_persistence_dir,
            enable_tts: true,
            tts_region: "us-east-1".to_string(),
            tts_timeout: Duration::from_secs(1),
            tts_max_attempts: 1,
            audio_cache_dir: None,
            audio_cache_max_bytes: 1 << 20,
            audio_cache_max_entries: 256,
            audio_cache_idle: Duration::from_secs(3600),
            ws_rate_limit_per_second: 100,
            max_clients_per_session: 50,
            session_timeout: Duration::from_secs(8 * 3600),
            admin_auth_rate_limit_per_minute: 100,
            admin_lockout_duration: Duration::from_millis(900_000),
            admin_lockout_threshold: 10,
            admin_identity_retention: Duration::from_secs(90 * 24 * 3600),
            admin_identity_cleanup_interval: Duration::from_secs(86_400),
            admin_identity_cleanup_enabled: true,
            session_cleanup_enabled: true,
            session_cleanup_interval: Duration::from_secs(3600),
            auth_grace_window: Duration::from_secs(5),
            token_expiry_warning: Duration::from_secs(300),
            broadcast_synthesis_concurrency: 4,
            shutdown_drain: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn test_missing_required_vars_are_all_named() {
        env::remove_var("COGNITO_REGION");
        env::remove_var("COGNITO_USER_POOL_ID");
        env::remove_var("COGNITO_CLIENT_ID");

        let err = Config::from_env().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("COGNITO_REGION"));
        assert!(msg.contains("COGNITO_USER_POOL_ID"));
        assert!(msg.contains("COGNITO_CLIENT_ID"));

        // Whitespace-only counts as missing.
        env::set_var("COGNITO_REGION", "  ");
        env::set_var("COGNITO_USER_POOL_ID", "us-east-1_AbC123");
        env::set_var("COGNITO_CLIENT_ID", "client123");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("COGNITO_REGION"));
        assert!(!err.to_string().contains("COGNITO_USER_POOL_ID"));

        // With all three present the defaults land.
        env::set_var("COGNITO_REGION", "us-east-1");
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.max_clients_per_session, 50);
        assert_eq!(config.admin_lockout_threshold, 10);
        assert_eq!(config.admin_lockout_duration, Duration::from_millis(900_000));
        assert_eq!(
            config.admin_identity_retention,
            Duration::from_secs(90 * 24 * 3600)
        );
        assert!(!config.enable_tts);
        assert_eq!(config.tts_region, "us-east-1");
        assert_eq!(config.public_url, "http://localhost:3001");

        // Garbage in an optional var falls back instead of aborting.
        env::set_var("PORT", "not-a-port");
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3001);
        env::remove_var("PORT");

        env::remove_var("COGNITO_REGION");
        env::remove_var("COGNITO_USER_POOL_ID");
        env::remove_var("COGNITO_CLIENT_ID");
    }
}
