//! identity-core - authentication and identity orchestration
//!
//! Coordinates credential verification, token issuance and refresh,
//! transactional registration and email confirmation across independently
//! owned collaborators.

pub mod core;

pub use crate::core::auth::{
    AuthFailure, AuthResult, AuthenticationOrchestrator, Credentials, FailureKind, Outcome,
};
