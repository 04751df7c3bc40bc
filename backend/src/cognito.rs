//! Operator identity verification against AWS Cognito.
//!
//! The hub never stores passwords or tokens: credentials are forwarded to
//! the user pool's password flow, tokens are validated on demand with
//! `GetUser`, and the provider's tokens are handed back to the operator
//! client verbatim. Every provider failure is classified into the hub error
//! taxonomy here, at the boundary.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cognitoidentityprovider::config::Region;
use aws_sdk_cognitoidentityprovider::error::SdkError;
use aws_sdk_cognitoidentityprovider::operation::get_user::GetUserError;
use aws_sdk_cognitoidentityprovider::operation::initiate_auth::InitiateAuthError;
use aws_sdk_cognitoidentityprovider::types::{AttributeType, AuthFlowType};
use aws_sdk_cognitoidentityprovider::Client;
use shared::CognitoTokens;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{HubError, HubResult};

/// Stable identity attributes extracted from the provider. `subject` is the
/// pool's opaque user id and is the only field used for authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub subject: String,
    pub username: String,
    pub email: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub expires_in: i64,
}

/// Seam for the external identity provider. The production implementation is
/// [`CognitoVerifier`]; tests supply in-process fakes.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> HubResult<(ProviderIdentity, CognitoTokens)>;

    async fn validate_access_token(&self, token: &str) -> HubResult<ProviderIdentity>;

    async fn refresh_access_token(
        &self,
        username: &str,
        refresh_token: &str,
    ) -> HubResult<RefreshedTokens>;
}

pub struct CognitoVerifier {
    client: Client,
    client_id: String,
    user_pool_id: String,
}

impl CognitoVerifier {
    pub async fn new(config: &Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.cognito_region.clone()))
            .load()
            .await;

        debug!(
            "Cognito verifier ready (pool {}, region {})",
            config.cognito_user_pool_id, config.cognito_region
        );

        Self {
            client: Client::new(&aws_config),
            client_id: config.cognito_client_id.clone(),
            user_pool_id: config.cognito_user_pool_id.clone(),
        }
    }

    #[allow(dead_code)]
    pub fn user_pool_id(&self) -> &str {
        &self.user_pool_id
    }

    fn identity_from_attributes(
        username: String,
        attributes: &[AttributeType],
    ) -> HubResult<ProviderIdentity> {
        let mut subject = None;
        let mut email = None;
        for attr in attributes {
            match attr.name() {
                "sub" => subject = attr.value().map(str::to_string),
                "email" => email = attr.value().map(str::to_string),
                _ => {}
            }
        }

        let Some(subject) = subject else {
            // A pool user without a sub attribute should not exist.
            return Err(HubError::ProviderUnavailable(
                "identity provider returned no subject attribute".to_string(),
            ));
        };

        Ok(ProviderIdentity {
            subject,
            email: email.unwrap_or_default(),
            username,
            groups: Vec::new(),
        })
    }
}

#[async_trait]
impl IdentityProvider for CognitoVerifier {
    async fn authenticate_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> HubResult<(ProviderIdentity, CognitoTokens)> {
        let result = self
            .client
            .initiate_auth()
            .auth_flow(AuthFlowType::UserPasswordAuth)
            .client_id(&self.client_id)
            .auth_parameters("USERNAME", username)
            .auth_parameters("PASSWORD", password)
            .send()
            .await
            .map_err(classify_initiate_auth)?;

        let Some(auth) = result.authentication_result() else {
            // A challenge (MFA, NEW_PASSWORD_REQUIRED) the hub does not drive.
            return Err(HubError::OperationNotAllowed(
                "identity provider requires an interactive challenge".to_string(),
            ));
        };

        let tokens = CognitoTokens {
            access_token: auth.access_token().unwrap_or_default().to_string(),
            id_token: auth.id_token().unwrap_or_default().to_string(),
            refresh_token: auth.refresh_token().unwrap_or_default().to_string(),
            expires_in: auth.expires_in() as i64,
        };

        // InitiateAuth does not return attributes; resolve the subject with
        // the token we just obtained.
        let identity = self.validate_access_token(&tokens.access_token).await?;

        Ok((identity, tokens))
    }

    async fn validate_access_token(&self, token: &str) -> HubResult<ProviderIdentity> {
        let user = self
            .client
            .get_user()
            .access_token(token)
            .send()
            .await
            .map_err(classify_get_user)?;

        Self::identity_from_attributes(user.username().to_string(), user.user_attributes())
    }

    async fn refresh_access_token(
        &self,
        username: &str,
        refresh_token: &str,
    ) -> HubResult<RefreshedTokens> {
        let result = self
            .client
            .initiate_auth()
            .auth_flow(AuthFlowType::RefreshTokenAuth)
            .client_id(&self.client_id)
            .auth_parameters("USERNAME", username)
            .auth_parameters("REFRESH_TOKEN", refresh_token)
            .send()
            .await
            .map_err(classify_refresh)?;

        let Some(auth) = result.authentication_result() else {
            return Err(HubError::RefreshTokenExpired);
        };

        Ok(RefreshedTokens {
            access_token: auth.access_token().unwrap_or_default().to_string(),
            expires_in: auth.expires_in() as i64,
        })
    }
}

fn classify_initiate_auth(e: SdkError<InitiateAuthError>) -> HubError {
    match e.as_service_error() {
        Some(err) if err.is_user_not_found_exception() => HubError::UserNotFound,
        Some(err) if err.is_not_authorized_exception() => {
            // Cognito reports a disabled account through NotAuthorized.
            let message = err
                .meta()
                .message()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if message.contains("disabled") {
                HubError::UserDisabled
            } else {
                HubError::InvalidCredentials
            }
        }
        Some(err) if err.is_user_not_confirmed_exception() => HubError::UserDisabled,
        Some(err) if err.is_password_reset_required_exception() => {
            HubError::OperationNotAllowed("password reset required".to_string())
        }
        Some(err) if err.is_too_many_requests_exception() => {
            HubError::ProviderUnavailable("identity provider throttled the request".to_string())
        }
        Some(err) => {
            warn!("unclassified Cognito InitiateAuth failure: {:?}", err);
            HubError::ProviderUnavailable(
                err.meta().message().unwrap_or("authentication failed").to_string(),
            )
        }
        None => HubError::ProviderUnavailable(e.to_string()),
    }
}

fn classify_get_user(e: SdkError<GetUserError>) -> HubError {
    match e.as_service_error() {
        Some(err) if err.is_not_authorized_exception() => {
            let message = err
                .meta()
                .message()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if message.contains("expired") {
                HubError::TokenExpired
            } else if message.contains("disabled") {
                HubError::UserDisabled
            } else {
                HubError::TokenInvalid(message)
            }
        }
        Some(err) if err.is_user_not_found_exception() => HubError::UserNotFound,
        Some(err) if err.is_too_many_requests_exception() => {
            HubError::ProviderUnavailable("identity provider throttled the request".to_string())
        }
        Some(err) => {
            warn!("unclassified Cognito GetUser failure: {:?}", err);
            HubError::TokenInvalid(
                err.meta().message().unwrap_or("token rejected").to_string(),
            )
        }
        None => HubError::ProviderUnavailable(e.to_string()),
    }
}

fn classify_refresh(e: SdkError<InitiateAuthError>) -> HubError {
    match e.as_service_error() {
        Some(err) if err.is_not_authorized_exception() => HubError::RefreshTokenExpired,
        Some(err) if err.is_user_not_found_exception() => HubError::UserNotFound,
        Some(err) if err.is_too_many_requests_exception() => {
            HubError::ProviderUnavailable("identity provider throttled the request".to_string())
        }
        Some(err) => {
            warn!("unclassified Cognito refresh failure: {:?}", err);
            HubError::RefreshTokenExpired
        }
        None => HubError::ProviderUnavailable(e.to_string()),
    }
}

#[cfg(test)]
pub mod test_support {
    //! In-process identity provider fake used across the backend tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct FakeIdentityProvider {
        users: Mutex<HashMap<String, FakeUser>>,
        pub provider_down: std::sync::atomic::AtomicBool,
    }

    #[derive(Clone)]
    pub struct FakeUser {
        pub subject: String,
        pub password: String,
        pub email: String,
        pub disabled: bool,
    }

    impl FakeIdentityProvider {
        pub fn new() -> Self {
            Self {
                users: Mutex::new(HashMap::new()),
                provider_down: std::sync::atomic::AtomicBool::new(false),
            }
        }

        pub fn with_user(self, username: &str, password: &str, subject: &str) -> Self {
            self.users.lock().unwrap().insert(
                username.to_string(),
                FakeUser {
                    subject: subject.to_string(),
                    password: password.to_string(),
                    email: username.to_string(),
                    disabled: false,
                },
            );
            self
        }

        fn check_down(&self) -> HubResult<()> {
            if self.provider_down.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(HubError::ProviderUnavailable("fake outage".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeIdentityProvider {
        async fn authenticate_credentials(
            &self,
            username: &str,
            password: &str,
        ) -> HubResult<(ProviderIdentity, CognitoTokens)> {
            self.check_down()?;
            let users = self.users.lock().unwrap();
            let Some(user) = users.get(username) else {
                return Err(HubError::UserNotFound);
            };
            if user.disabled {
                return Err(HubError::UserDisabled);
            }
            if user.password != password {
                return Err(HubError::InvalidCredentials);
            }
            Ok((
                ProviderIdentity {
                    subject: user.subject.clone(),
                    username: username.to_string(),
                    email: user.email.clone(),
                    groups: Vec::new(),
                },
                CognitoTokens {
                    access_token: format!("access-{}", user.subject),
                    id_token: format!("id-{}", user.subject),
                    refresh_token: format!("refresh-{}", user.subject),
                    expires_in: 3600,
                },
            ))
        }

        async fn validate_access_token(&self, token: &str) -> HubResult<ProviderIdentity> {
            self.check_down()?;
            let users = self.users.lock().unwrap();
            for (username, user) in users.iter() {
                if token == format!("access-{}", user.subject) {
                    if user.disabled {
                        return Err(HubError::UserDisabled);
                    }
                    return Ok(ProviderIdentity {
                        subject: user.subject.clone(),
                        username: username.clone(),
                        email: user.email.clone(),
                        groups: Vec::new(),
                    });
                }
            }
            Err(HubError::TokenInvalid("unknown token".to_string()))
        }

        async fn refresh_access_token(
            &self,
            _username: &str,
            refresh_token: &str,
        ) -> HubResult<RefreshedTokens> {
            self.check_down()?;
            let users = self.users.lock().unwrap();
            for user in users.values() {
                if refresh_token == format!("refresh-{}", user.subject) {
                    return Ok(RefreshedTokens {
                        access_token: format!("access-{}", user.subject),
                        expires_in: 3600,
                    });
                }
            }
            Err(HubError::RefreshTokenExpired)
        }
    }
}
