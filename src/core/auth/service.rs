//! Authentication orchestrator
//!
//! Sequences the credential store, token issuer, notification sender and
//! transaction coordinator into the five public identity operations. Each
//! operation short-circuits on the first collaborator failure and forwards it
//! unchanged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::auth::models::{AuthResult, Credentials};
use crate::core::auth::outcome::{AuthFailure, Outcome};
use crate::core::auth::ports::{
    CredentialStore, NotificationSender, TokenIssuer, TransactionCoordinator, transactional,
};

/// Path appended to the configured base URL for confirmation links
const CONFIRMATION_PATH: &str = "confirm-email";

/// What `send_confirmation_email` does when delivery fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationFailurePolicy {
    /// Return the sender's failure to the caller
    #[default]
    Propagate,
    /// Log the failure and report success; the token stays valid
    LogAndContinue,
}

impl std::str::FromStr for NotificationFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "propagate" => Ok(Self::Propagate),
            "log_and_continue" | "log" | "ignore" => Ok(Self::LogAndContinue),
            other => Err(format!("unknown notification failure policy '{other}'")),
        }
    }
}

/// Injected configuration of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Base for `{base}/confirm-email?token={token}` links
    pub confirmation_base_url: Url,
    pub notification_failure_policy: NotificationFailurePolicy,
}

impl OrchestratorSettings {
    pub fn new(confirmation_base_url: Url) -> Self {
        Self {
            confirmation_base_url,
            notification_failure_policy: NotificationFailurePolicy::default(),
        }
    }

    pub fn notification_failure_policy(mut self, policy: NotificationFailurePolicy) -> Self {
        self.notification_failure_policy = policy;
        self
    }

    /// Build the confirmation link for `token`
    pub fn confirmation_link(&self, token: &str) -> Outcome<Url> {
        let mut link = self.confirmation_base_url.clone();
        link.set_fragment(None);
        link.path_segments_mut()
            .map_err(|()| {
                tracing::error!(
                    base = %self.confirmation_base_url,
                    "confirmation base URL cannot carry a path"
                );
                AuthFailure::internal("Confirmation link could not be built")
            })?
            .pop_if_empty()
            .push(CONFIRMATION_PATH);
        link.query_pairs_mut().append_pair("token", token);
        Ok(link)
    }
}

/// Stateless coordinator of the identity use-cases
#[derive(Clone)]
pub struct AuthenticationOrchestrator {
    credentials: Arc<dyn CredentialStore>,
    tokens: Arc<dyn TokenIssuer>,
    notifications: Arc<dyn NotificationSender>,
    transactions: Arc<dyn TransactionCoordinator>,
    settings: OrchestratorSettings,
}

impl AuthenticationOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<dyn TokenIssuer>,
        notifications: Arc<dyn NotificationSender>,
        transactions: Arc<dyn TransactionCoordinator>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            credentials,
            tokens,
            notifications,
            transactions,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Verify credentials and issue a token pair
    pub async fn authenticate(&self, credentials: &Credentials) -> Outcome<AuthResult> {
        tracing::debug!("authenticate");

        let user = self
            .credentials
            .verify_password(&credentials.username_or_email, &credentials.password)
            .await
            .inspect_err(|failure| log_failure("authenticate", failure))?;

        let tokens = self
            .tokens
            .generate(user.id, &user.email)
            .await
            .inspect_err(|failure| log_failure("authenticate", failure))?;

        tracing::info!(user_id = %user.id, "user authenticated");
        Ok(tokens.into())
    }

    /// Create a user and its first token pair in one transaction.
    ///
    /// If issuing the tokens fails the created user is rolled back.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Outcome<AuthResult> {
        tracing::debug!(username, "register");

        let work = async {
            let user = self.credentials.create(username, email, password).await?;
            let tokens = self.tokens.generate(user.id, &user.email).await?;
            Ok::<_, AuthFailure>((user.id, tokens))
        };

        let (user_id, tokens) = transactional(self.transactions.as_ref(), work)
            .await
            .inspect_err(|failure| log_failure("register", failure))?;

        tracing::info!(%user_id, "user registered");
        Ok(tokens.into())
    }

    /// Exchange a refresh token for a new pair
    pub async fn refresh(&self, refresh_token: &str) -> Outcome<AuthResult> {
        tracing::debug!("refresh");

        let tokens = self
            .tokens
            .rotate(refresh_token)
            .await
            .inspect_err(|failure| log_failure("refresh", failure))?;

        Ok(tokens.into())
    }

    /// Consume a confirmation token. No tokens are issued; the result
    /// carries the confirmed user.
    pub async fn confirm_email(&self, email: &str, token: &str) -> Outcome<AuthResult> {
        tracing::debug!("confirm_email");

        let user = self
            .credentials
            .confirm_email(email, token)
            .await
            .inspect_err(|failure| log_failure("confirm_email", failure))?;

        tracing::info!(user_id = %user.id, "email confirmed");
        Ok(user.into())
    }

    /// Mint a confirmation token and email the link to an unconfirmed user
    pub async fn send_confirmation_email(&self, email: &str) -> Outcome<()> {
        tracing::debug!("send_confirmation_email");

        let user = self
            .credentials
            .find_by_email(email)
            .await
            .inspect_err(|failure| log_failure("send_confirmation_email", failure))?;

        if user.email_confirmed {
            return Err(AuthFailure::email_already_confirmed());
        }

        let token = self
            .credentials
            .generate_confirmation_token(email)
            .await
            .inspect_err(|failure| log_failure("send_confirmation_email", failure))?;

        let link = self.settings.confirmation_link(&token)?;

        let delivery = self
            .notifications
            .send_confirmation_email(&user.email, &user.username, link.as_str())
            .await;

        match (delivery, self.settings.notification_failure_policy) {
            (Ok(()), _) => {
                tracing::info!(user_id = %user.id, "confirmation email sent");
                Ok(())
            }
            (Err(failure), NotificationFailurePolicy::Propagate) => {
                log_failure("send_confirmation_email", &failure);
                Err(failure)
            }
            (Err(failure), NotificationFailurePolicy::LogAndContinue) => {
                tracing::warn!(
                    user_id = %user.id,
                    kind = %failure.kind(),
                    error = %failure,
                    "confirmation email not delivered; continuing"
                );
                Ok(())
            }
        }
    }
}

fn log_failure(operation: &'static str, failure: &AuthFailure) {
    tracing::warn!(operation, kind = %failure.kind(), error = %failure, "operation failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base: &str) -> OrchestratorSettings {
        OrchestratorSettings::new(Url::parse(base).unwrap())
    }

    #[test]
    fn test_confirmation_link() {
        let link = settings("https://id.example.com")
            .confirmation_link("abc123")
            .unwrap();
        assert_eq!(
            link.as_str(),
            "https://id.example.com/confirm-email?token=abc123"
        );
    }

    #[test]
    fn test_confirmation_link_with_path_and_trailing_slash() {
        let link = settings("https://example.com/identity/")
            .confirmation_link("abc")
            .unwrap();
        assert_eq!(
            link.as_str(),
            "https://example.com/identity/confirm-email?token=abc"
        );
    }

    #[test]
    fn test_confirmation_link_keeps_path_ahead_of_base_query() {
        let link = settings("https://id.example.com/app?tenant=1#top")
            .confirmation_link("tok")
            .unwrap();

        assert_eq!(link.path(), "/app/confirm-email");
        assert_eq!(link.query(), Some("tenant=1&token=tok"));
        assert_eq!(link.fragment(), None);
    }

    #[test]
    fn test_confirmation_link_rejects_opaque_base() {
        let err = settings("mailto:ops@example.com")
            .confirmation_link("tok")
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::auth::FailureKind::Internal);
    }

    #[test]
    fn test_confirmation_link_encodes_token() {
        let link = settings("https://id.example.com")
            .confirmation_link("a b&c=d")
            .unwrap();
        let token = link
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());
        assert_eq!(token.as_deref(), Some("a b&c=d"));
    }

    #[test]
    fn test_notification_policy_parsing() {
        assert_eq!(
            "propagate".parse::<NotificationFailurePolicy>().unwrap(),
            NotificationFailurePolicy::Propagate
        );
        assert_eq!(
            "LOG_AND_CONTINUE".parse::<NotificationFailurePolicy>().unwrap(),
            NotificationFailurePolicy::LogAndContinue
        );
        assert!("sometimes".parse::<NotificationFailurePolicy>().is_err());
        assert_eq!(
            NotificationFailurePolicy::default(),
            NotificationFailurePolicy::Propagate
        );
    }
}
