//! Credential store backed by the `users` and `email_confirmation_tokens`
//! tables
//!
//! Passwords are bcrypt hashes; confirmation tokens are stored as SHA-256
//! digests. Statements join the transaction opened by
//! [`PgTransactionCoordinator`](crate::core::db::PgTransactionCoordinator)
//! when one is active on the current task.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::auth::crypto::{self, BCRYPT_COST, CONFIRMATION_TOKEN_TTL_HOURS};
use crate::core::auth::validation::{normalize_email, validate_registration};
use crate::core::auth::{AuthFailure, CredentialStore, Outcome, UserIdentity};
use crate::core::db::database_failure;
use crate::core::db::models::UserRow;
use crate::core::db::transaction::{execute, fetch_optional};

const USER_COLUMNS: &str =
    "id, username, email, password_hash, email_confirmed, created_at, updated_at";

const EMAIL_CONSTRAINT: &str = "users_email_unique";
const USERNAME_CONSTRAINT: &str = "users_username_unique";

/// [`CredentialStore`] over PostgreSQL
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    bcrypt_cost: u32,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            bcrypt_cost: BCRYPT_COST,
        }
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    async fn user_by_email(&self, email: &str) -> Outcome<Option<UserRow>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email_key = $1");
        fetch_optional(
            &self.pool,
            sqlx::query_as::<_, UserRow>(&sql).bind(normalize_email(email)),
        )
        .await
        .map_err(|err| database_failure("find user by email", err))
    }

    async fn user_by_login(&self, username_or_email: &str) -> Outcome<Option<UserRow>> {
        // An exact email match wins over a username that looks like one
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email_key = $1 OR username = $2 \
             ORDER BY (email_key = $1) DESC LIMIT 1"
        );
        fetch_optional(
            &self.pool,
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(normalize_email(username_or_email))
                .bind(username_or_email.to_string()),
        )
        .await
        .map_err(|err| database_failure("find user by login", err))
    }
}

fn map_insert_error(err: sqlx::Error) -> AuthFailure {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        match db_err.constraint() {
            Some(EMAIL_CONSTRAINT) => return AuthFailure::duplicate_email(),
            Some(USERNAME_CONSTRAINT) => return AuthFailure::duplicate_username(),
            _ => {}
        }
    }
    database_failure("create user", err)
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn verify_password(
        &self,
        username_or_email: &str,
        password: &str,
    ) -> Outcome<UserIdentity> {
        let user = self
            .user_by_login(username_or_email)
            .await?
            .ok_or_else(AuthFailure::user_not_found)?;

        if !crypto::verify_password(password, &user.password_hash).await? {
            return Err(AuthFailure::invalid_credentials());
        }

        Ok(user.into())
    }

    async fn create(&self, username: &str, email: &str, password: &str) -> Outcome<UserIdentity> {
        validate_registration(username, email, password)?;

        let password_hash = crypto::hash_password(password, self.bcrypt_cost).await?;
        let sql = format!(
            "INSERT INTO users (id, username, email, email_key, password_hash) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        );

        let user = fetch_optional(
            &self.pool,
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(Uuid::new_v4())
                .bind(username.to_string())
                .bind(email.trim().to_string())
                .bind(normalize_email(email))
                .bind(password_hash),
        )
        .await
        .map_err(map_insert_error)?
        .ok_or_else(|| AuthFailure::internal("User insert returned no row"))?;

        tracing::debug!(user_id = %user.id, "user created");
        Ok(user.into())
    }

    async fn find_by_email(&self, email: &str) -> Outcome<UserIdentity> {
        self.user_by_email(email)
            .await?
            .map(UserIdentity::from)
            .ok_or_else(AuthFailure::user_not_found)
    }

    async fn find_by_id(&self, id: Uuid) -> Outcome<UserIdentity> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        fetch_optional(&self.pool, sqlx::query_as::<_, UserRow>(&sql).bind(id))
            .await
            .map_err(|err| database_failure("find user by id", err))?
            .map(UserIdentity::from)
            .ok_or_else(AuthFailure::user_not_found)
    }

    async fn confirm_email(&self, email: &str, token: &str) -> Outcome<UserIdentity> {
        let user = self
            .user_by_email(email)
            .await?
            .ok_or_else(AuthFailure::user_not_found)?;

        // The token row is deleted whether or not it is still live, so a
        // token can never be presented twice.
        let sql = format!(
            "WITH consumed AS ( \
                 DELETE FROM email_confirmation_tokens \
                 WHERE user_id = $1 AND token_hash = $2 \
                 RETURNING expires_at \
             ) \
             UPDATE users SET email_confirmed = TRUE, updated_at = NOW() \
             WHERE id = $1 AND EXISTS (SELECT 1 FROM consumed WHERE expires_at > NOW()) \
             RETURNING {USER_COLUMNS}"
        );

        let confirmed = fetch_optional(
            &self.pool,
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(user.id)
                .bind(crypto::hash_token(token)),
        )
        .await
        .map_err(|err| database_failure("confirm email", err))?
        .ok_or_else(AuthFailure::invalid_or_expired_token)?;

        tracing::debug!(user_id = %confirmed.id, "email confirmed");
        Ok(confirmed.into())
    }

    async fn generate_confirmation_token(&self, email: &str) -> Outcome<String> {
        let user = self
            .user_by_email(email)
            .await?
            .ok_or_else(AuthFailure::user_not_found)?;

        let token = crypto::generate_confirmation_token();

        // One row per user: a new token replaces any earlier one
        execute(
            &self.pool,
            sqlx::query(
                "INSERT INTO email_confirmation_tokens (id, user_id, token_hash, expires_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (user_id) DO UPDATE SET \
                     id = EXCLUDED.id, \
                     token_hash = EXCLUDED.token_hash, \
                     expires_at = EXCLUDED.expires_at, \
                     created_at = NOW()",
            )
            .bind(Uuid::new_v4())
            .bind(user.id)
            .bind(crypto::hash_token(&token))
            .bind(Utc::now() + Duration::hours(CONFIRMATION_TOKEN_TTL_HOURS)),
        )
        .await
        .map_err(|err| database_failure("store confirmation token", err))?;

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::FailureKind;
    use crate::core::db::pool::{DbConfig, create_pool_with_migrations};

    const PASSWORD: &str = "Secure123";

    async fn store() -> PgCredentialStore {
        let config = DbConfig::from_env().expect("DATABASE_URL must be set");
        let pool = create_pool_with_migrations(&config)
            .await
            .expect("Failed to create pool");
        PgCredentialStore::new(pool).with_bcrypt_cost(4)
    }

    fn unique_name(prefix: &str) -> String {
        format!("{prefix}{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    #[test]
    fn test_non_database_errors_map_to_internal() {
        let failure = map_insert_error(sqlx::Error::RowNotFound);
        assert_eq!(failure.kind(), FailureKind::Internal);
        assert_eq!(failure.message(), "Credential store unavailable");
    }

    #[tokio::test]
    #[ignore = "requires running PostgreSQL database"]
    async fn test_create_and_verify_by_email_or_username() {
        let store = store().await;
        let username = unique_name("u");
        let email = format!("{username}@Example.com");

        let created = store.create(&username, &email, PASSWORD).await.unwrap();
        assert!(!created.email_confirmed);

        let by_email = store
            .verify_password(&email.to_uppercase(), PASSWORD)
            .await
            .unwrap();
        assert_eq!(by_email.id, created.id);

        let by_username = store.verify_password(&username, PASSWORD).await.unwrap();
        assert_eq!(by_username.id, created.id);

        let wrong = store.verify_password(&username, "Wrong1234").await;
        assert_eq!(wrong.unwrap_err().kind(), FailureKind::InvalidCredentials);

        assert_eq!(store.find_by_id(created.id).await.unwrap().email, email);
    }

    #[tokio::test]
    #[ignore = "requires running PostgreSQL database"]
    async fn test_duplicate_email_and_username() {
        let store = store().await;
        let username = unique_name("d");
        let email = format!("{username}@example.com");
        store.create(&username, &email, PASSWORD).await.unwrap();

        let other = unique_name("o");
        let dup_email = store
            .create(&other, &email.to_uppercase(), PASSWORD)
            .await
            .unwrap_err();
        assert_eq!(dup_email.kind(), FailureKind::DuplicateEmail);

        let dup_username = store
            .create(&username, &format!("{other}@example.com"), PASSWORD)
            .await
            .unwrap_err();
        assert_eq!(dup_username.kind(), FailureKind::DuplicateUsername);
    }

    #[tokio::test]
    #[ignore = "requires running PostgreSQL database"]
    async fn test_confirmation_token_is_single_use() {
        let store = store().await;
        let username = unique_name("c");
        let email = format!("{username}@example.com");
        store.create(&username, &email, PASSWORD).await.unwrap();

        let stale = store.generate_confirmation_token(&email).await.unwrap();
        let token = store.generate_confirmation_token(&email).await.unwrap();

        let superseded = store.confirm_email(&email, &stale).await.unwrap_err();
        assert_eq!(superseded.kind(), FailureKind::InvalidOrExpiredToken);

        let confirmed = store.confirm_email(&email, &token).await.unwrap();
        assert!(confirmed.email_confirmed);

        let replay = store.confirm_email(&email, &token).await.unwrap_err();
        assert_eq!(replay.kind(), FailureKind::InvalidOrExpiredToken);
    }

    #[tokio::test]
    #[ignore = "requires running PostgreSQL database"]
    async fn test_concurrent_confirmation_tokens_leave_one_live() {
        let store = store().await;
        let username = unique_name("t");
        let email = format!("{username}@example.com");
        store.create(&username, &email, PASSWORD).await.unwrap();

        let (first, second) = tokio::join!(
            store.generate_confirmation_token(&email),
            store.generate_confirmation_token(&email),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        let confirmed = [
            store.confirm_email(&email, &first).await.is_ok(),
            store.confirm_email(&email, &second).await.is_ok(),
        ];
        assert_eq!(confirmed.iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    #[ignore = "requires running PostgreSQL database"]
    async fn test_unknown_user() {
        let store = store().await;
        let email = format!("{}@example.com", unique_name("missing"));

        assert_eq!(
            store.find_by_email(&email).await.unwrap_err().kind(),
            FailureKind::UserNotFound
        );
        assert_eq!(
            store
                .generate_confirmation_token(&email)
                .await
                .unwrap_err()
                .kind(),
            FailureKind::UserNotFound
        );
    }
}
