//! Hub error taxonomy and its mapping onto wire error frames.
//!
//! Every failure surfaced to a client goes through [`HubError`]: provider
//! errors are classified in `cognito`/`tts`, storage errors in the stores,
//! and the router converts the result into an `admin-error` frame (or the
//! legacy short `error` frame on listener connections). Unclassified causes
//! stay in server-side logs only.

use shared::{now_iso, ErrorCode, ErrorDetails, ServerFrame};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    // Authentication
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("access token expired")]
    TokenExpired,

    #[error("access token invalid: {0}")]
    TokenInvalid(String),

    #[error("refresh token expired")]
    RefreshTokenExpired,

    #[error("user not found")]
    UserNotFound,

    #[error("user account disabled")]
    UserDisabled,

    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("rate limited for {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("account locked for {retry_after}s")]
    AccountLocked { retry_after: u64 },

    // Authorization
    #[error("access denied")]
    AccessDenied,

    #[error("session {0} is not owned by the caller")]
    SessionNotOwned(String),

    #[error("insufficient permissions for {0}")]
    InsufficientPermissions(String),

    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),

    // Session
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} already exists")]
    SessionAlreadyExists(String),

    #[error("session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("session update failed: {0}")]
    SessionUpdateFailed(String),

    #[error("session delete failed: {0}")]
    SessionDeleteFailed(String),

    #[error("session listener limit reached ({0})")]
    ClientLimitReached(usize),

    // Admin identity
    #[error("admin identity not found")]
    AdminNotFound,

    #[error("admin identity creation failed: {0}")]
    AdminCreationFailed(String),

    #[error("admin identity data corrupted: {0}")]
    AdminDataCorrupted(String),

    // System
    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server is shutting down")]
    MaintenanceMode,

    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    // Validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("language {0:?} is not enabled for this session")]
    InvalidLanguage(String),

    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

impl HubError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::InvalidCredentials => ErrorCode::InvalidCredentials,
            HubError::TokenExpired => ErrorCode::TokenExpired,
            HubError::TokenInvalid(_) => ErrorCode::TokenInvalid,
            HubError::RefreshTokenExpired => ErrorCode::RefreshTokenExpired,
            HubError::UserNotFound => ErrorCode::UserNotFound,
            HubError::UserDisabled => ErrorCode::UserDisabled,
            HubError::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
            HubError::RateLimited { .. } => ErrorCode::RateLimited,
            HubError::AccountLocked { .. } => ErrorCode::AccountLocked,
            HubError::AccessDenied => ErrorCode::AccessDenied,
            HubError::SessionNotOwned(_) => ErrorCode::SessionNotOwned,
            HubError::InsufficientPermissions(_) => ErrorCode::InsufficientPermissions,
            HubError::OperationNotAllowed(_) => ErrorCode::OperationNotAllowed,
            HubError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            HubError::SessionAlreadyExists(_) => ErrorCode::SessionAlreadyExists,
            HubError::SessionCreationFailed(_) => ErrorCode::SessionCreationFailed,
            HubError::SessionUpdateFailed(_) => ErrorCode::SessionUpdateFailed,
            HubError::SessionDeleteFailed(_) => ErrorCode::SessionDeleteFailed,
            HubError::ClientLimitReached(_) => ErrorCode::ClientLimitReached,
            HubError::AdminNotFound => ErrorCode::AdminNotFound,
            HubError::AdminCreationFailed(_) => ErrorCode::AdminCreationFailed,
            HubError::AdminDataCorrupted(_) => ErrorCode::AdminDataCorrupted,
            HubError::Internal(_) => ErrorCode::InternalError,
            HubError::Storage(_) => ErrorCode::StorageError,
            HubError::Network(_) => ErrorCode::NetworkError,
            HubError::MaintenanceMode => ErrorCode::MaintenanceMode,
            HubError::ConnectionLimitExceeded => ErrorCode::ConnectionLimitExceeded,
            HubError::InvalidInput(_) => ErrorCode::InvalidInput,
            HubError::MissingField(_) => ErrorCode::MissingRequiredField,
            HubError::InvalidSessionId(_) => ErrorCode::InvalidSessionId,
            HubError::InvalidLanguage(_) => ErrorCode::InvalidLanguage,
            HubError::InvalidConfig(_) => ErrorCode::InvalidConfig,
        }
    }

    /// Whether a client may retry the same operation. Authorization and
    /// validation failures must not be retried automatically.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            HubError::ProviderUnavailable(_)
                | HubError::RateLimited { .. }
                | HubError::AccountLocked { .. }
                | HubError::TokenExpired
                | HubError::SessionCreationFailed(_)
                | HubError::SessionUpdateFailed(_)
                | HubError::SessionDeleteFailed(_)
                | HubError::AdminCreationFailed(_)
                | HubError::Internal(_)
                | HubError::Storage(_)
                | HubError::Network(_)
                | HubError::MaintenanceMode
        )
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            HubError::RateLimited { retry_after } | HubError::AccountLocked { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Phrase safe to show in an end-user UI. Never includes identifiers or
    /// provider detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            HubError::InvalidCredentials => "Incorrect username or password.",
            HubError::TokenExpired => "Your session expired. Please sign in again.",
            HubError::TokenInvalid(_) => "Your session is no longer valid. Please sign in again.",
            HubError::RefreshTokenExpired => "Your session expired. Please sign in again.",
            HubError::UserNotFound => "Incorrect username or password.",
            HubError::UserDisabled => "This account has been disabled.",
            HubError::ProviderUnavailable(_) => {
                "The sign-in service is temporarily unavailable. Please try again."
            }
            HubError::RateLimited { .. } => "Too many requests. Please wait and try again.",
            HubError::AccountLocked { .. } => {
                "Too many failed attempts. Please wait and try again."
            }
            HubError::AccessDenied | HubError::InsufficientPermissions(_) => {
                "You don't have permission to do that."
            }
            HubError::SessionNotOwned(_) => "Only the session owner can do that.",
            HubError::OperationNotAllowed(_) => "That operation isn't allowed right now.",
            HubError::SessionNotFound(_) => "That session doesn't exist.",
            HubError::SessionAlreadyExists(_) => "A session with that id already exists.",
            HubError::SessionCreationFailed(_) => "Couldn't create the session. Please try again.",
            HubError::SessionUpdateFailed(_) => "Couldn't update the session. Please try again.",
            HubError::SessionDeleteFailed(_) => "Couldn't end the session. Please try again.",
            HubError::ClientLimitReached(_) => "This session is full.",
            HubError::AdminNotFound | HubError::AdminCreationFailed(_) => {
                "Something went wrong with your account. Please sign in again."
            }
            HubError::AdminDataCorrupted(_) => {
                "Something went wrong with your account. Please contact support."
            }
            HubError::Internal(_) | HubError::Storage(_) | HubError::Network(_) => {
                "Something went wrong. Please try again."
            }
            HubError::MaintenanceMode => "The server is restarting. Please reconnect shortly.",
            HubError::ConnectionLimitExceeded => "The server is at capacity. Please try later.",
            HubError::InvalidInput(_) | HubError::MissingField(_) | HubError::InvalidConfig(_) => {
                "The request was invalid."
            }
            HubError::InvalidSessionId(_) => "That session id is not valid.",
            HubError::InvalidLanguage(_) => "That language isn't available in this session.",
        }
    }

    /// Build the structured `admin-error` frame for operator connections.
    pub fn to_admin_frame(&self, details: ErrorDetails) -> ServerFrame {
        ServerFrame::AdminError {
            error_code: self.code(),
            message: self.to_string(),
            user_message: self.user_message().to_string(),
            retryable: self.retryable(),
            retry_after: self.retry_after(),
            details,
            timestamp: now_iso(),
        }
    }

    /// Build the legacy short error frame for listener connections.
    pub fn to_listener_frame(&self) -> ServerFrame {
        ServerFrame::Error {
            code: self.code(),
            message: self.user_message().to_string(),
            timestamp: now_iso(),
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Storage(format!("serialization: {}", e))
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_split() {
        assert!(HubError::ProviderUnavailable("down".into()).retryable());
        assert!(HubError::Storage("disk".into()).retryable());
        assert!(HubError::RateLimited { retry_after: 30 }.retryable());

        assert!(!HubError::SessionNotOwned("X-2025-001".into()).retryable());
        assert!(!HubError::InvalidCredentials.retryable());
        assert!(!HubError::InvalidSessionId("..".into()).retryable());
        assert!(!HubError::UserDisabled.retryable());
    }

    #[test]
    fn test_retry_after_only_on_limit_errors() {
        assert_eq!(
            HubError::RateLimited { retry_after: 30 }.retry_after(),
            Some(30)
        );
        assert_eq!(
            HubError::AccountLocked { retry_after: 900 }.retry_after(),
            Some(900)
        );
        assert_eq!(HubError::AccessDenied.retry_after(), None);
    }

    #[test]
    fn test_admin_frame_shape() {
        let err = HubError::SessionNotOwned("CHURCH-2025-001".to_string());
        let frame = err.to_admin_frame(ErrorDetails {
            session_id: Some("CHURCH-2025-001".to_string()),
            operation: Some("end-session".to_string()),
            ..Default::default()
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"admin-error""#));
        assert!(json.contains(r#""errorCode":"SESSION_NOT_OWNED""#));
        assert!(json.contains(r#""retryable":false"#));
        assert!(json.contains(r#""operation":"end-session""#));
    }

    #[test]
    fn test_user_messages_never_leak_detail() {
        let err = HubError::Storage("/var/data/admin-identities/abc.json: EACCES".to_string());
        assert!(!err.user_message().contains("EACCES"));
        assert!(!err.user_message().contains("/var"));
    }
}
