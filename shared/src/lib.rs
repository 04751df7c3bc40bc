use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// Protocol constants and session id validation
pub mod protocol;
pub use protocol::*;

/// Target languages the hub can broadcast. Closed set; the voice catalog and
/// the session config validator both key off this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Es,
    Fr,
    De,
    It,
    Pt,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::En,
        Language::Es,
        Language::Fr,
        Language::De,
        Language::It,
        Language::Pt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
            Language::Fr => "fr",
            Language::De => "de",
            Language::It => "it",
            Language::Pt => "pt",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "en" => Ok(Language::En),
            "es" => Ok(Language::Es),
            "fr" => Ok(Language::Fr),
            "de" => Ok(Language::De),
            "it" => Ok(Language::It),
            "pt" => Ok(Language::Pt),
            _ => Err(()),
        }
    }
}

/// How a session wants its audio produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsMode {
    Neural,
    Standard,
    Local,
    Disabled,
}

/// How the audio for one translation was actually produced. `Local` and
/// `TextOnly` are sentinel tiers: no bytes, the listener renders on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceTier {
    Neural,
    Standard,
    Local,
    TextOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    High,
    Medium,
    Low,
}

/// Per-session broadcast configuration, fixed schema. Unknown fields are
/// rejected at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionConfig {
    pub enabled_languages: Vec<Language>,
    pub tts_mode: TtsMode,
    pub audio_quality: AudioQuality,
}

/// What a listener client says it can render. Absent fields mean "cannot".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerCapabilities {
    #[serde(default)]
    pub can_play_synthesized: bool,
    /// Device has its own speech-synthesis engine (browser speechSynthesis).
    #[serde(default)]
    pub can_synthesize_locally: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
}

/// Session metadata as shared with operators. `is_owner` is computed per
/// requesting admin; everything else is the stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub admin_id: String,
    pub created_by: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub listener_count: usize,
    pub created_at: String,
    pub last_activity: String,
    pub is_owner: bool,
}

/// Cognito tokens forwarded verbatim to the operator client after a
/// credentials login. The hub never stores these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitoTokens {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Operator permission bitmap. Reserved bits default to true for now; group
/// tags from the identity provider will narrow these later.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_create_sessions: bool,
    pub can_manage_own_sessions: bool,
    pub can_view_all_sessions: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            can_create_sessions: true,
            can_manage_own_sessions: true,
            can_view_all_sessions: true,
        }
    }
}

/// Metadata for one synthesized audio object, sent alongside its URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetadata {
    pub format: String,
    pub byte_size: usize,
    pub duration_estimate_secs: f32,
    pub voice_profile: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Credentials,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionFilter {
    #[default]
    All,
    Owned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageAction {
    Add,
    Remove,
}

/// Error codes surfaced to clients. Grouped by the taxonomy kind; the code is
/// the stable wire contract, the grouping is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication
    InvalidCredentials,
    TokenExpired,
    TokenInvalid,
    RefreshTokenExpired,
    UserNotFound,
    UserDisabled,
    ProviderUnavailable,
    RateLimited,
    AccountLocked,
    // Authorization
    AccessDenied,
    SessionNotOwned,
    InsufficientPermissions,
    OperationNotAllowed,
    // Session
    SessionNotFound,
    SessionAlreadyExists,
    InvalidSessionConfig,
    SessionCreationFailed,
    SessionUpdateFailed,
    SessionDeleteFailed,
    ClientLimitReached,
    // Admin identity
    AdminNotFound,
    AdminCreationFailed,
    AdminDataCorrupted,
    // System
    InternalError,
    StorageError,
    NetworkError,
    MaintenanceMode,
    ConnectionLimitExceeded,
    // Validation
    InvalidInput,
    MissingRequiredField,
    InvalidSessionId,
    InvalidLanguage,
    InvalidConfig,
}

/// Structured detail block attached to admin-error frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

impl ErrorDetails {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.admin_id.is_none()
            && self.operation.is_none()
            && self.validation_errors.is_empty()
    }
}

/// Frames the hub accepts, from both connection roles. The first frame on a
/// socket decides its role: `admin-auth` makes it an operator connection,
/// `join-session` makes it a listener connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Operator authentication, by password or by a previously issued token.
    AdminAuth {
        method: AuthMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Exchange a refresh token for a fresh access token.
    TokenRefresh {
        username: String,
        refresh_token: String,
    },

    StartSession {
        session_id: String,
        config: SessionConfig,
        /// Display name recorded on the session; never used for authorization.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_by: Option<String>,
    },

    EndSession {
        session_id: String,
    },

    UpdateSessionConfig {
        session_id: String,
        config: SessionConfig,
    },

    ListSessions {
        #[serde(default)]
        filter: SessionFilter,
    },

    /// Explicit access check / metadata fetch for one session.
    AdminSessionAccess {
        session_id: String,
        mode: AccessMode,
    },

    /// The hot path: one translated utterance fanned out to every listener
    /// whose preferred language has a translation.
    BroadcastTranslation {
        session_id: String,
        source_text: String,
        translations: HashMap<Language, String>,
        #[serde(default)]
        generate_tts: bool,
        /// Operator-requested tier; falls back to the session's ttsMode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_tier: Option<TtsMode>,
    },

    /// One-shot synthesis outside a broadcast (voice test, pre-generation).
    GenerateTts {
        session_id: String,
        text: String,
        language: Language,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_tier: Option<TtsMode>,
    },

    TtsConfigUpdate {
        session_id: String,
        tts_mode: TtsMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_quality: Option<AudioQuality>,
    },

    /// Convenience single-language toggle; equivalent to an
    /// update-session-config with one language added or removed.
    LanguageUpdate {
        session_id: String,
        language: Language,
        action: LanguageAction,
    },

    JoinSession {
        session_id: String,
        preferred_language: Language,
        #[serde(default)]
        capabilities: ListenerCapabilities,
    },

    LeaveSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    ChangeLanguage {
        new_language: Language,
    },

    /// Keep-alive; echoed back and refreshes lastSeen.
    Heartbeat,
}

/// Frames the hub emits. Response frames carry the originating type suffixed
/// with `-response`; events get their own type. Every frame has an ISO-8601
/// UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    AdminAuthResponse {
        success: bool,
        admin_id: String,
        username: String,
        email: String,
        /// Present only for credentials auth; token auth re-uses the
        /// client-held tokens.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<CognitoTokens>,
        owned_sessions: Vec<SessionSummary>,
        all_sessions: Vec<SessionSummary>,
        permissions: Permissions,
        timestamp: String,
    },

    TokenRefreshResponse {
        success: bool,
        access_token: String,
        expires_in: i64,
        timestamp: String,
    },

    /// Emitted after token auth when previously owned sessions were found.
    AdminReconnection {
        recovered_sessions: Vec<String>,
        timestamp: String,
    },

    AdminError {
        error_code: ErrorCode,
        message: String,
        user_message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        #[serde(default, skip_serializing_if = "ErrorDetails::is_empty")]
        details: ErrorDetails,
        timestamp: String,
    },

    StartSessionResponse {
        success: bool,
        session: SessionSummary,
        timestamp: String,
    },

    EndSessionResponse {
        success: bool,
        session_id: String,
        timestamp: String,
    },

    UpdateSessionConfigResponse {
        success: bool,
        session_id: String,
        config: SessionConfig,
        removed_languages: Vec<Language>,
        timestamp: String,
    },

    ListSessionsResponse {
        sessions: Vec<SessionSummary>,
        timestamp: String,
    },

    GenerateTtsResponse {
        success: bool,
        tier: VoiceTier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<AudioMetadata>,
        timestamp: String,
    },

    /// Returned to a listener on join.
    SessionMetadata {
        session_id: String,
        config: SessionConfig,
        status: SessionStatus,
        tts_available: bool,
        timestamp: String,
    },

    /// Roster digest pushed to the owning operator after roster changes.
    SessionMetadataUpdate {
        session_id: String,
        listener_counts: HashMap<Language, usize>,
        total_listeners: usize,
        timestamp: String,
    },

    SessionEnded {
        session_id: String,
        reason: String,
        timestamp: String,
    },

    /// Config change notification to listeners still in the session.
    ConfigUpdated {
        session_id: String,
        config: SessionConfig,
        timestamp: String,
    },

    /// The personalized broadcast frame: exactly one per listener per
    /// broadcast, in the listener's preferred language.
    Translation {
        session_id: String,
        source_text: String,
        language: Language,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<AudioMetadata>,
        tts_available: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<VoiceTier>,
        timestamp: String,
    },

    /// The listener's language was removed from the session config.
    LanguageRemoved {
        session_id: String,
        language: Language,
        remaining_languages: Vec<Language>,
        timestamp: String,
    },

    TtsConfigUpdate {
        session_id: String,
        tts_mode: TtsMode,
        audio_quality: AudioQuality,
        timestamp: String,
    },

    /// Non-fatal notice to the operator that synthesis degraded tiers.
    TtsFallback {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<Language>,
        requested: VoiceTier,
        actual: VoiceTier,
        reason: String,
        timestamp: String,
    },

    /// Advisory warning ahead of access-token expiry.
    TokenExpiryWarning {
        expires_in_secs: u64,
        timestamp: String,
    },

    ServerShutdown {
        reason: String,
        reconnect: bool,
        timestamp: String,
    },

    /// Legacy short-form error for listener connections.
    Error {
        code: ErrorCode,
        message: String,
        timestamp: String,
    },

    Heartbeat,
}

/// Connection handle type used across the hub. Sockets are transient; these
/// ids never appear in persisted state.
pub type SocketId = Uuid;

/// Wire timestamp: ISO-8601 UTC with millisecond precision and a `Z` suffix.
pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
