//! Authentication and identity orchestration
//!
//! This module provides:
//! - The [`AuthenticationOrchestrator`] and its uniform [`Outcome`] results
//! - Collaborator ports for credential storage, token issuance, email
//!   delivery and transactions
//! - A JWT token issuer, notification senders and in-memory adapters

pub mod crypto;
pub mod jwt;
pub mod memory;
pub mod models;
pub mod notify;
pub mod outcome;
pub mod ports;
pub mod service;
pub mod validation;


pub use jwt::{JwtConfig, JwtError, JwtTokenIssuer};
pub use memory::{InMemoryCredentialStore, InMemoryTransactionCoordinator, MemoryDatabase};
pub use models::{AuthResult, AuthenticatedUser, Credentials, TokenPair, UserIdentity};
pub use notify::LogNotificationSender;
#[cfg(feature = "webhook")]
pub use notify::{WebhookConfig, WebhookNotificationSender};
pub use outcome::{AuthFailure, FailureCategory, FailureKind, Outcome};
pub use ports::{
    CredentialStore, NotificationSender, TokenIssuer, TransactionCoordinator, TransactionScope,
    transactional,
};
pub use service::{AuthenticationOrchestrator, NotificationFailurePolicy, OrchestratorSettings};
