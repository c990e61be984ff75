//! Database module
//!
//! PostgreSQL adapters for the credential store and transaction coordinator,
//! built on SQLx.

pub mod models;
pub mod pool;
pub mod repositories;
pub mod transaction;

pub use pool::{DbConfig, DbError, create_pool, create_pool_with_migrations, health_check};
pub use repositories::PgCredentialStore;
pub use transaction::PgTransactionCoordinator;

// Re-export sqlx types that might be needed
pub use sqlx::PgPool;

use crate::core::auth::AuthFailure;

/// Log a driver error and return the opaque failure callers see
pub(crate) fn database_failure(context: &'static str, err: sqlx::Error) -> AuthFailure {
    tracing::error!(error = %err, context, "database operation failed");
    AuthFailure::internal("Credential store unavailable")
}
