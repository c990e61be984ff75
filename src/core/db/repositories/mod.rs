//! Database repositories
//!
//! Repositories implement the credential ports on top of PostgreSQL.

pub mod credential;

pub use credential::PgCredentialStore;
