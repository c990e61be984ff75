//! Input shape rules applied by credential stores before creating a user

use crate::core::auth::outcome::AuthFailure;

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 50;
const PASSWORD_MIN_LEN: usize = 8;

/// Validate email format
pub fn validate_email(email: &str) -> Result<(), AuthFailure> {
    let invalid = || AuthFailure::validation("Invalid email format");

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }

    // Domain needs at least two non-empty labels
    if !domain.contains('.') || domain.split('.').any(str::is_empty) {
        return Err(invalid());
    }

    Ok(())
}

/// Validate username format
pub fn validate_username(username: &str) -> Result<(), AuthFailure> {
    let length = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&length) {
        return Err(AuthFailure::validation(format!(
            "Username must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters"
        )));
    }

    if !username.chars().next().is_some_and(char::is_alphabetic) {
        return Err(AuthFailure::validation("Username must start with a letter"));
    }

    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AuthFailure::validation(
            "Username may only contain letters, numbers, underscores and hyphens",
        ));
    }

    Ok(())
}

/// Validate password strength
pub fn validate_password(password: &str) -> Result<(), AuthFailure> {
    if password.chars().count() < PASSWORD_MIN_LEN {
        return Err(AuthFailure::validation(format!(
            "Password too short (minimum {PASSWORD_MIN_LEN} characters)"
        )));
    }

    let has_uppercase = password.chars().any(char::is_uppercase);
    let has_lowercase = password.chars().any(char::is_lowercase);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());

    if !has_uppercase || !has_lowercase || !has_digit {
        return Err(AuthFailure::validation("Password too weak"));
    }

    Ok(())
}

/// Run every registration rule, email first
pub fn validate_registration(username: &str, email: &str, password: &str) -> Result<(), AuthFailure> {
    validate_email(email)?;
    validate_username(username)?;
    validate_password(password)
}

/// Canonical form used for email lookups and uniqueness
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
