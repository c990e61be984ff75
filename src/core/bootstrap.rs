//! Production wiring of the orchestrator

use std::sync::Arc;

use crate::core::auth::{
    AuthenticationOrchestrator, JwtError, JwtTokenIssuer, LogNotificationSender,
    NotificationSender,
};
use crate::core::config::{Config, ConfigError};
use crate::core::db::{DbConfig, DbError, PgCredentialStore, PgTransactionCoordinator};

/// Errors raised while assembling the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Jwt(#[from] JwtError),

    #[cfg(feature = "webhook")]
    #[error("Failed to build notification client: {0}")]
    Notification(#[from] reqwest::Error),
}

/// Build an orchestrator over PostgreSQL, JWT and the configured mail relay
pub async fn build_orchestrator(config: &Config) -> Result<AuthenticationOrchestrator, BootstrapError> {
    let settings = config.orchestrator_settings()?;

    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let pool = crate::core::db::create_pool_with_migrations(&DbConfig::new(database_url)).await?;

    let tokens = JwtTokenIssuer::from_env()?;
    let notifications = notification_sender(config)?;

    tracing::info!(
        policy = ?settings.notification_failure_policy,
        "authentication orchestrator ready"
    );

    Ok(AuthenticationOrchestrator::new(
        Arc::new(PgCredentialStore::new(pool.clone())),
        Arc::new(tokens),
        notifications,
        Arc::new(PgTransactionCoordinator::new(pool)),
        settings,
    ))
}

#[cfg(feature = "webhook")]
fn notification_sender(config: &Config) -> Result<Arc<dyn NotificationSender>, BootstrapError> {
    use crate::core::auth::{WebhookConfig, WebhookNotificationSender};

    match &config.notification_webhook_url {
        Some(endpoint) => {
            let mut webhook = WebhookConfig::new(endpoint.clone());
            if let Some(key) = &config.notification_api_key {
                webhook = webhook.api_key(key.clone());
            }
            tracing::info!(endpoint = %endpoint, "confirmation emails go to mail relay");
            Ok(Arc::new(WebhookNotificationSender::new(webhook)?))
        }
        None => {
            tracing::info!("NOTIFICATION_WEBHOOK_URL not set, confirmation emails are logged");
            Ok(Arc::new(LogNotificationSender))
        }
    }
}

#[cfg(not(feature = "webhook"))]
fn notification_sender(config: &Config) -> Result<Arc<dyn NotificationSender>, BootstrapError> {
    if config.has_notification_webhook() {
        tracing::warn!("built without the webhook feature, confirmation emails are logged");
    }
    Ok(Arc::new(LogNotificationSender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_base_url_fails_before_connecting() {
        let config = Config {
            database_url: Some("postgres://localhost/identity".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            build_orchestrator(&config).await,
            Err(BootstrapError::Config(ConfigError::Missing(
                "CONFIRMATION_BASE_URL"
            )))
        ));
    }

    #[tokio::test]
    async fn test_missing_database_url() {
        let config = Config {
            confirmation_base_url: Some("https://id.example.com".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            build_orchestrator(&config).await,
            Err(BootstrapError::Config(ConfigError::Missing("DATABASE_URL")))
        ));
    }

    #[test]
    fn test_log_sender_without_webhook() {
        assert!(notification_sender(&Config::default()).is_ok());
    }
}
