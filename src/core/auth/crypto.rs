//! Password hashing and confirmation-token secrets
//!
//! bcrypt work runs on the blocking pool so credential checks never stall the
//! async runtime. Confirmation tokens are stored only as SHA-256 hashes.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::core::auth::outcome::AuthFailure;

/// Cost factor for bcrypt hashing (12 is recommended for production)
pub const BCRYPT_COST: u32 = 12;

/// Lifetime of an email confirmation token
pub const CONFIRMATION_TOKEN_TTL_HOURS: i64 = 24;

/// Random bytes in a confirmation token before hex encoding
const CONFIRMATION_TOKEN_BYTES: usize = 32;

/// Hash a password using bcrypt with automatic salt generation
pub async fn hash_password(password: &str, cost: u32) -> Result<String, AuthFailure> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "password hashing task failed");
            AuthFailure::internal("Password hashing failed")
        })?
        .map_err(|err| {
            tracing::error!(error = %err, "bcrypt hash failed");
            AuthFailure::internal("Password hashing failed")
        })
}

/// Verify a password against a bcrypt hash
pub async fn verify_password(password: &str, hash: &str) -> Result<bool, AuthFailure> {
    let password = password.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "password verification task failed");
            AuthFailure::internal("Password verification failed")
        })?
        .map_err(|err| {
            tracing::error!(error = %err, "stored password hash is unreadable");
            AuthFailure::internal("Password verification failed")
        })
}

/// Fresh hex-encoded confirmation token
pub fn generate_confirmation_token() -> String {
    let mut bytes = [0u8; CONFIRMATION_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a token using SHA-256
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
