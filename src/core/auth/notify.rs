//! Notification senders for confirmation emails

use async_trait::async_trait;

use crate::core::auth::outcome::Outcome;
use crate::core::auth::ports::NotificationSender;

/// Development sender: records the delivery in the log and succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send_confirmation_email(
        &self,
        email: &str,
        display_name: &str,
        link: &str,
    ) -> Outcome<()> {
        tracing::info!(
            recipient = email,
            display_name,
            link,
            "confirmation email (log delivery)"
        );
        Ok(())
    }
}

#[cfg(feature = "webhook")]
pub use webhook::{WebhookConfig, WebhookNotificationSender};

#[cfg(feature = "webhook")]
mod webhook {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::Serialize;

    use crate::core::auth::outcome::{AuthFailure, Outcome};
    use crate::core::auth::ports::NotificationSender;

    const CONFIRMATION_TEMPLATE: &str = "confirm-email";
    const DEFAULT_TIMEOUT_SECS: u64 = 10;

    /// Mail relay endpoint settings
    #[derive(Clone)]
    pub struct WebhookConfig {
        pub endpoint: String,
        pub api_key: Option<String>,
        pub timeout_secs: u64,
    }

    impl WebhookConfig {
        pub fn new(endpoint: impl Into<String>) -> Self {
            Self {
                endpoint: endpoint.into(),
                api_key: None,
                timeout_secs: DEFAULT_TIMEOUT_SECS,
            }
        }

        pub fn api_key(mut self, key: impl Into<String>) -> Self {
            self.api_key = Some(key.into());
            self
        }

        pub fn timeout(mut self, secs: u64) -> Self {
            self.timeout_secs = secs;
            self
        }
    }

    #[derive(Debug, Serialize)]
    pub(super) struct RelayMessage<'a> {
        pub to: &'a str,
        pub display_name: &'a str,
        pub link: &'a str,
        pub template: &'static str,
    }

    /// Posts confirmation emails to an HTTP mail relay
    #[derive(Clone)]
    pub struct WebhookNotificationSender {
        client: reqwest::Client,
        config: WebhookConfig,
    }

    impl WebhookNotificationSender {
        pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?;
            Ok(Self { client, config })
        }
    }

    #[async_trait]
    impl NotificationSender for WebhookNotificationSender {
        async fn send_confirmation_email(
            &self,
            email: &str,
            display_name: &str,
            link: &str,
        ) -> Outcome<()> {
            let message = RelayMessage {
                to: email,
                display_name,
                link,
                template: CONFIRMATION_TEMPLATE,
            };

            let mut request = self.client.post(&self.config.endpoint).json(&message);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }

            let response = request.send().await.map_err(|err| {
                tracing::warn!(error = %err, "mail relay unreachable");
                AuthFailure::delivery("Confirmation email could not be delivered")
            })?;

            let status = response.status();
            if !status.is_success() {
                tracing::warn!(%status, "mail relay rejected confirmation email");
                return Err(AuthFailure::delivery(format!(
                    "Mail relay responded with {status}"
                )));
            }

            Ok(())
        }
    }
}
