//! Database row types

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::core::auth::UserIdentity;

/// Row of the `users` table
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub email_confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserRow> for UserIdentity {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            email: row.email,
            email_confirmed: row.email_confirmed,
        }
    }
}
