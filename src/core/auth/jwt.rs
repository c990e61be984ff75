//! JWT-backed token issuer
//!
//! HS256 access/refresh pairs. Access tokens are short-lived (15 minutes),
//! refresh tokens are long-lived (7 days) and single-use: rotating one
//! consumes it.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::auth::models::TokenPair;
use crate::core::auth::outcome::{AuthFailure, Outcome};
use crate::core::auth::ports::TokenIssuer;

/// Default access token expiration time (15 minutes)
const ACCESS_TOKEN_EXPIRATION_MINUTES: i64 = 15;

/// Default refresh token expiration time (7 days)
const REFRESH_TOKEN_EXPIRATION_DAYS: i64 = 7;

/// Upper bounds accepted from the environment
const MAX_ACCESS_TOKEN_EXPIRATION_MINUTES: i64 = 24 * 60;
const MAX_REFRESH_TOKEN_EXPIRATION_DAYS: i64 = 365;

const DEFAULT_ISSUER: &str = "identity-core";

/// JWT configuration
#[derive(Clone)]
pub struct JwtConfig {
    /// Secret key for signing tokens
    pub secret: String,
    /// Access token expiration in minutes
    pub access_token_expiration_minutes: i64,
    /// Refresh token expiration in days
    pub refresh_token_expiration_days: i64,
    /// Token issuer
    pub issuer: String,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field(
                "access_token_expiration_minutes",
                &self.access_token_expiration_minutes,
            )
            .field(
                "refresh_token_expiration_days",
                &self.refresh_token_expiration_days,
            )
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl JwtConfig {
    /// Create a new JWT configuration
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            access_token_expiration_minutes: ACCESS_TOKEN_EXPIRATION_MINUTES,
            refresh_token_expiration_days: REFRESH_TOKEN_EXPIRATION_DAYS,
            issuer: DEFAULT_ISSUER.to_string(),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Result<Self, JwtError> {
        let secret = std::env::var("JWT_SECRET").map_err(|_| JwtError::MissingSecret)?;

        let access_exp = expiration_from_env(
            "JWT_ACCESS_EXPIRATION_MINUTES",
            ACCESS_TOKEN_EXPIRATION_MINUTES,
            MAX_ACCESS_TOKEN_EXPIRATION_MINUTES,
        )?;

        let refresh_exp = expiration_from_env(
            "JWT_REFRESH_EXPIRATION_DAYS",
            REFRESH_TOKEN_EXPIRATION_DAYS,
            MAX_REFRESH_TOKEN_EXPIRATION_DAYS,
        )?;

        let issuer = std::env::var("JWT_ISSUER").unwrap_or_else(|_| DEFAULT_ISSUER.to_string());

        Ok(Self {
            secret,
            access_token_expiration_minutes: access_exp,
            refresh_token_expiration_days: refresh_exp,
            issuer,
        })
    }

    /// Set access token expiration
    pub fn access_token_expiration(mut self, minutes: i64) -> Self {
        self.access_token_expiration_minutes = minutes;
        self
    }

    /// Set refresh token expiration
    pub fn refresh_token_expiration(mut self, days: i64) -> Self {
        self.refresh_token_expiration_days = days;
        self
    }

    /// Set issuer
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }
}

/// Read a lifetime variable, `default` when unset
fn expiration_from_env(name: &'static str, default: i64, max: i64) -> Result<i64, JwtError> {
    match std::env::var(name) {
        Ok(raw) => parse_expiration(name, &raw, max),
        Err(_) => Ok(default),
    }
}

/// Accept whole numbers in `1..=max`
fn parse_expiration(name: &'static str, raw: &str, max: i64) -> Result<i64, JwtError> {
    match raw.trim().parse::<i64>() {
        Ok(value) if (1..=max).contains(&value) => Ok(value),
        _ => Err(JwtError::InvalidExpiration {
            name,
            value: raw.to_string(),
            max,
        }),
    }
}

/// JWT configuration errors
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWT_SECRET environment variable not set")]
    MissingSecret,

    #[error("{name} must be a whole number between 1 and {max}, got '{value}'")]
    InvalidExpiration {
        name: &'static str,
        value: String,
        max: i64,
    },
}

/// Token type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    pub email: String,
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub iss: String,
    /// JWT ID, the key used to detect refresh token reuse
    pub jti: String,
}

fn classify_decode_error(err: jsonwebtoken::errors::Error) -> AuthFailure {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => AuthFailure::expired_token(),
        _ => AuthFailure::malformed_token(),
    }
}

/// [`TokenIssuer`] that signs HS256 JWTs
pub struct JwtTokenIssuer {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// jti -> expiry of refresh tokens already rotated
    consumed_refresh_tokens: DashMap<String, i64>,
}

impl JwtTokenIssuer {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        Self {
            config,
            encoding_key,
            decoding_key,
            consumed_refresh_tokens: DashMap::new(),
        }
    }

    /// Create JWT issuer from environment variables
    pub fn from_env() -> Result<Self, JwtError> {
        Ok(Self::new(JwtConfig::from_env()?))
    }

    fn sign(
        &self,
        user_id: Uuid,
        email: &str,
        token_type: TokenType,
        lifetime: Duration,
    ) -> Outcome<(String, i64)> {
        let now = Utc::now();
        let exp = now.checked_add_signed(lifetime).ok_or_else(|| {
            tracing::error!(?token_type, "token lifetime out of range");
            AuthFailure::issuance("Token lifetime out of range")
        })?;

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            token_type,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.config.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key).map_err(|err| {
            tracing::error!(error = %err, "token encoding failed");
            AuthFailure::issuance("Token encoding failed")
        })?;

        Ok((token, exp.timestamp()))
    }

    fn issue_pair(&self, user_id: Uuid, email: &str) -> Outcome<TokenPair> {
        let access_lifetime = Duration::try_minutes(self.config.access_token_expiration_minutes);
        let refresh_lifetime = Duration::try_days(self.config.refresh_token_expiration_days);
        let (Some(access_lifetime), Some(refresh_lifetime)) = (access_lifetime, refresh_lifetime)
        else {
            tracing::error!(config = ?self.config, "token lifetime out of range");
            return Err(AuthFailure::issuance("Token lifetime out of range"));
        };

        let (access_token, access_expires_at) =
            self.sign(user_id, email, TokenType::Access, access_lifetime)?;
        let (refresh_token, refresh_expires_at) =
            self.sign(user_id, email, TokenType::Refresh, refresh_lifetime)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
            token_type: "Bearer".to_string(),
        })
    }

    /// Validate and decode a token
    pub fn validate_token(&self, token: &str) -> Outcome<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);
        // Strict expiration checking
        validation.leeway = 0;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(classify_decode_error)
    }

    #[cfg(test)]
    fn validate_access_token(&self, token: &str) -> Outcome<Claims> {
        let claims = self.validate_token(token)?;

        if claims.token_type != TokenType::Access {
            return Err(AuthFailure::malformed_token());
        }

        Ok(claims)
    }

    /// Record `jti` as used; fails if it already was
    fn consume(&self, jti: String, exp: i64) -> Outcome<()> {
        let now = Utc::now().timestamp();
        self.consumed_refresh_tokens.retain(|_, expires| *expires > now);

        match self.consumed_refresh_tokens.entry(jti) {
            Entry::Occupied(_) => Err(AuthFailure::revoked_token()),
            Entry::Vacant(slot) => {
                slot.insert(exp);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TokenIssuer for JwtTokenIssuer {
    async fn generate(&self, user_id: Uuid, email: &str) -> Outcome<TokenPair> {
        self.issue_pair(user_id, email)
    }

    async fn rotate(&self, refresh_token: &str) -> Outcome<TokenPair> {
        let claims = self.validate_token(refresh_token)?;

        if claims.token_type != TokenType::Refresh {
            return Err(AuthFailure::malformed_token());
        }

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthFailure::malformed_token())?;

        // A signing failure must leave the refresh token usable
        let pair = self.issue_pair(user_id, &claims.email)?;
        self.consume(claims.jti, claims.exp)?;

        tracing::debug!(%user_id, "refresh token rotated");
        Ok(pair)
    }
}
