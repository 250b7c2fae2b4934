//! Identity provider adapter and the auth gate built on it.
//!
//! The gate is created once at start-up and handed to everything that needs
//! the current owner id. Its ternary state is published on a watch channel
//! so route protection can follow sign-in and sign-out.

use crate::config::IdentityConfig;
use crate::error::AuthError;
use crate::model::OwnerId;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cognitoidentityprovider::config::Builder as CognitoConfigBuilder;
use aws_sdk_cognitoidentityprovider::error::SdkError;
use aws_sdk_cognitoidentityprovider::operation::get_user::GetUserError;
use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// The signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentUser {
    pub id: OwnerId,
    pub email: Option<String>,
    pub session_valid: bool,
}

/// Hosted identity provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Fails when no session exists
    async fn current_user(&self) -> Result<CurrentUser, AuthError>;

    /// End the session everywhere
    async fn sign_out(&self) -> Result<(), AuthError>;
}

/// Cognito user pool session identified by its access token
pub struct CognitoIdentity {
    client: CognitoClient,
    access_token: Option<String>,
}

impl CognitoIdentity {
    pub async fn new(config: &IdentityConfig, access_token: Option<String>) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = CognitoConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(region = %config.region, "Cognito identity client initialized");

        Self {
            client: CognitoClient::from_conf(builder.build()),
            access_token,
        }
    }

    fn token(&self) -> Result<&str, AuthError> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NoSession)
    }
}

#[async_trait]
impl IdentityService for CognitoIdentity {
    #[instrument(skip(self))]
    async fn current_user(&self) -> Result<CurrentUser, AuthError> {
        let token = self.token()?;

        let output = self
            .client
            .get_user()
            .access_token(token)
            .send()
            .await
            .map_err(map_get_user_error)?;

        let attribute = |name: &str| {
            output
                .user_attributes()
                .iter()
                .find(|a| a.name() == name)
                .and_then(|a| a.value())
                .map(str::to_string)
        };

        let id = attribute("sub")
            .and_then(OwnerId::new)
            .ok_or_else(|| AuthError::Unknown("user has no `sub` attribute".to_string()))?;

        Ok(CurrentUser {
            id,
            email: attribute("email"),
            session_valid: true,
        })
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), AuthError> {
        let token = self.token()?;

        self.client
            .global_sign_out()
            .access_token(token)
            .send()
            .await
            .map_err(|e| AuthError::Unknown(e.to_string()))?;

        Ok(())
    }
}

/// Map Cognito exception kinds onto the closed auth error set
fn map_get_user_error<R>(error: SdkError<GetUserError, R>) -> AuthError
where
    R: std::fmt::Debug,
{
    match error.as_service_error() {
        Some(e) if e.is_not_authorized_exception() => AuthError::InvalidCredentials,
        Some(e) if e.is_user_not_found_exception() => AuthError::UserNotFound,
        Some(e) if e.is_user_not_confirmed_exception() => AuthError::NotVerified,
        Some(e) if e.is_password_reset_required_exception() => AuthError::InvalidCredentials,
        Some(e) => AuthError::Unknown(e.to_string()),
        None => AuthError::Unknown(error.to_string()),
    }
}

/// Route-protection view of the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "user", rename_all = "camelCase")]
pub enum AuthState {
    /// Not checked yet
    Pending,
    Authenticated(CurrentUser),
    Unauthenticated,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }
}

/// Session context passed to every component that needs the owner id.
///
/// An authenticated state is trusted for `session_ttl`; after that the next
/// `require_owner` asks the identity provider again.
pub struct AuthGate {
    identity: Box<dyn IdentityService>,
    state: watch::Sender<AuthState>,
    session_ttl: Duration,
    checked_at: Mutex<Option<Instant>>,
}

impl AuthGate {
    pub fn new(identity: impl IdentityService + 'static) -> Self {
        let (state, _) = watch::channel(AuthState::Pending);
        Self {
            identity: Box::new(identity),
            state,
            session_ttl: Duration::from_secs(300),
            checked_at: Mutex::new(None),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Ask the identity provider and publish the result
    #[instrument(skip(self))]
    pub async fn check(&self) -> AuthState {
        let state = match self.identity.current_user().await {
            Ok(user) if user.session_valid => {
                debug!(owner = %user.id, "Session is valid");
                AuthState::Authenticated(user)
            }
            Ok(user) => {
                debug!(owner = %user.id, "Session expired");
                AuthState::Unauthenticated
            }
            Err(e) => {
                debug!(error = %e, "No usable session");
                AuthState::Unauthenticated
            }
        };

        self.state.send_replace(state.clone());
        if let Ok(mut checked_at) = self.checked_at.lock() {
            *checked_at = Some(Instant::now());
        }
        state
    }

    fn is_stale(&self) -> bool {
        match self.checked_at.lock() {
            Ok(checked_at) => checked_at.map_or(true, |at| at.elapsed() >= self.session_ttl),
            Err(_) => true,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Owner id of the signed-in user. Checks the session first while pending
    /// or once the last check is older than the session ttl. Never yields an
    /// anonymous owner.
    pub async fn require_owner(&self) -> Result<OwnerId, AuthError> {
        let state = match self.state() {
            AuthState::Authenticated(_) if self.is_stale() => self.check().await,
            AuthState::Pending => self.check().await,
            state => state,
        };

        match state {
            AuthState::Authenticated(user) => Ok(user.id),
            _ => Err(AuthError::NoSession),
        }
    }

    /// Sign out; the gate reports unauthenticated even if the provider call fails
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let result = self.identity.sign_out().await;
        if let Err(ref e) = result {
            warn!(error = %e, "Identity provider sign-out failed");
        }
        self.state.send_replace(AuthState::Unauthenticated);
        result
    }
}
