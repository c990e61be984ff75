//! Collaborator ports consumed by the orchestrator
//!
//! Each port is an object-safe async trait with one production adapter in this
//! crate; tests substitute doubles.

use std::future::Future;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::core::auth::models::{TokenPair, UserIdentity};
use crate::core::auth::outcome::{AuthFailure, Outcome};

/// Credential storage: verification, user creation and email confirmation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Check a password for the user matching `username_or_email`.
    ///
    /// Fails with `UserNotFound` or `InvalidCredentials`.
    async fn verify_password(
        &self,
        username_or_email: &str,
        password: &str,
    ) -> Outcome<UserIdentity>;

    /// Create a user. Fails with `DuplicateEmail`, `DuplicateUsername` or
    /// `Validation`.
    async fn create(&self, username: &str, email: &str, password: &str) -> Outcome<UserIdentity>;

    async fn find_by_email(&self, email: &str) -> Outcome<UserIdentity>;

    async fn find_by_id(&self, id: Uuid) -> Outcome<UserIdentity>;

    /// Consume a confirmation token and mark the email confirmed.
    ///
    /// Fails with `InvalidOrExpiredToken` or `UserNotFound`.
    async fn confirm_email(&self, email: &str, token: &str) -> Outcome<UserIdentity>;

    /// Mint a single-use confirmation token for `email`.
    async fn generate_confirmation_token(&self, email: &str) -> Outcome<String>;
}

/// Access/refresh token minting
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Fails with `IssuanceError`.
    async fn generate(&self, user_id: Uuid, email: &str) -> Outcome<TokenPair>;

    /// Exchange a refresh token for a new pair.
    ///
    /// Fails with `ExpiredToken`, `RevokedToken` or `MalformedToken`.
    async fn rotate(&self, refresh_token: &str) -> Outcome<TokenPair>;
}

/// Outbound email delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Fails with `DeliveryError`.
    async fn send_confirmation_email(
        &self,
        email: &str,
        display_name: &str,
        link: &str,
    ) -> Outcome<()>;
}

/// Unit of work handed to a [`TransactionCoordinator`]
pub type TransactionScope<'a> = BoxFuture<'a, Outcome<()>>;

/// Runs a unit of work atomically.
///
/// Implementations commit only when the scope resolves to `Ok`. They roll back
/// when it resolves to `Err`, when it panics (before the panic resumes) and
/// when the `run` future is dropped before completion.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    async fn run<'a>(&'a self, scope: TransactionScope<'a>) -> Outcome<()>;
}

/// Run `work` inside one transaction and hand back its value
pub async fn transactional<T, F>(coordinator: &dyn TransactionCoordinator, work: F) -> Outcome<T>
where
    T: Send,
    F: Future<Output = Outcome<T>> + Send,
{
    let mut value = None;
    let scope = async {
        value = Some(work.await?);
        Ok::<(), AuthFailure>(())
    }
    .boxed();

    coordinator.run(scope).await?;

    value.ok_or_else(|| AuthFailure::internal("Transaction committed without a result"))
}
