//! Value types exchanged between the orchestrator, its collaborators and
//! callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered user as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub email_confirmed: bool,
}

/// Login input. Never persisted or logged.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username_or_email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username_or_email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username_or_email: username_or_email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username_or_email", &self.username_or_email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token pair (access + refresh)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Access token (short-lived)
    pub access_token: String,
    /// Refresh token (long-lived)
    pub refresh_token: String,
    /// Access token expiration (Unix timestamp)
    pub access_expires_at: i64,
    /// Refresh token expiration (Unix timestamp)
    pub refresh_expires_at: i64,
    /// Token type (always "Bearer")
    pub token_type: String,
}

/// Public part of a user carried in an [`AuthResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub email_confirmed: bool,
}

/// Success payload of the orchestrator's token and confirmation operations.
///
/// Token operations fill the token fields; email confirmation fills `user`
/// and leaves the token fields empty since nothing is re-issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AuthenticatedUser>,
}

impl From<TokenPair> for AuthResult {
    fn from(tokens: TokenPair) -> Self {
        Self {
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
            access_expires_at: Some(tokens.access_expires_at),
            refresh_expires_at: Some(tokens.refresh_expires_at),
            token_type: Some(tokens.token_type),
            user: None,
        }
    }
}

impl From<UserIdentity> for AuthResult {
    fn from(user: UserIdentity) -> Self {
        Self {
            user: Some(AuthenticatedUser {
                id: user.id,
                username: user.username,
                email: user.email,
                email_confirmed: user.email_confirmed,
            }),
            ..Default::default()
        }
    }
}
