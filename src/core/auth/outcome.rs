//! Uniform result type shared by the orchestrator and its collaborators
//!
//! Every port method and every orchestrator operation returns an [`Outcome`].
//! Failures carry a [`FailureKind`] that collaborators choose and the
//! orchestrator forwards untouched.

use serde::{Deserialize, Serialize};

/// Result of any identity operation
pub type Outcome<T> = Result<T, AuthFailure>;

/// Concrete failure kinds surfaced by identity operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Input has the wrong shape (email format, weak password, ...)
    Validation,
    InvalidCredentials,
    UserNotFound,
    DuplicateEmail,
    DuplicateUsername,
    EmailAlreadyConfirmed,
    /// Email confirmation token unknown, consumed, or past its lifetime
    InvalidOrExpiredToken,
    ExpiredToken,
    RevokedToken,
    MalformedToken,
    IssuanceError,
    DeliveryError,
    /// Unexpected infrastructure fault; details are logged, never returned
    Internal,
}

/// Coarse grouping of failure kinds, used by presentation layers to pick a
/// transport status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Dependency,
    Internal,
}

impl FailureKind {
    /// Category this kind belongs to
    pub fn category(self) -> FailureCategory {
        match self {
            FailureKind::Validation => FailureCategory::Validation,
            FailureKind::UserNotFound => FailureCategory::NotFound,
            FailureKind::DuplicateEmail
            | FailureKind::DuplicateUsername
            | FailureKind::EmailAlreadyConfirmed => FailureCategory::Conflict,
            FailureKind::InvalidCredentials
            | FailureKind::InvalidOrExpiredToken
            | FailureKind::ExpiredToken
            | FailureKind::RevokedToken
            | FailureKind::MalformedToken => FailureCategory::Unauthorized,
            FailureKind::IssuanceError | FailureKind::DeliveryError => {
                FailureCategory::Dependency
            }
            FailureKind::Internal => FailureCategory::Internal,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Validation => "validation",
            FailureKind::InvalidCredentials => "invalid_credentials",
            FailureKind::UserNotFound => "user_not_found",
            FailureKind::DuplicateEmail => "duplicate_email",
            FailureKind::DuplicateUsername => "duplicate_username",
            FailureKind::EmailAlreadyConfirmed => "email_already_confirmed",
            FailureKind::InvalidOrExpiredToken => "invalid_or_expired_token",
            FailureKind::ExpiredToken => "expired_token",
            FailureKind::RevokedToken => "revoked_token",
            FailureKind::MalformedToken => "malformed_token",
            FailureKind::IssuanceError => "issuance_error",
            FailureKind::DeliveryError => "delivery_error",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Typed failure: a kind plus a human-readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct AuthFailure {
    kind: FailureKind,
    message: String,
}

impl AuthFailure {
    /// Create a failure of the given kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> FailureCategory {
        self.kind.category()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn invalid_credentials() -> Self {
        Self::new(FailureKind::InvalidCredentials, "Invalid credentials")
    }

    pub fn user_not_found() -> Self {
        Self::new(FailureKind::UserNotFound, "User not found")
    }

    pub fn duplicate_email() -> Self {
        Self::new(FailureKind::DuplicateEmail, "Email already registered")
    }

    pub fn duplicate_username() -> Self {
        Self::new(FailureKind::DuplicateUsername, "Username already taken")
    }

    pub fn email_already_confirmed() -> Self {
        Self::new(FailureKind::EmailAlreadyConfirmed, "Email already confirmed")
    }

    pub fn invalid_or_expired_token() -> Self {
        Self::new(
            FailureKind::InvalidOrExpiredToken,
            "Confirmation token is invalid or expired",
        )
    }

    pub fn expired_token() -> Self {
        Self::new(FailureKind::ExpiredToken, "Token expired")
    }

    pub fn revoked_token() -> Self {
        Self::new(FailureKind::RevokedToken, "Token revoked")
    }

    pub fn malformed_token() -> Self {
        Self::new(FailureKind::MalformedToken, "Malformed token")
    }

    pub fn issuance(message: impl Into<String>) -> Self {
        Self::new(FailureKind::IssuanceError, message)
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DeliveryError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}
