use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("Stored password hash is malformed: {0}")]
    MalformedHash(String),
    #[error("Password verification failed: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

/// Compares a submitted password with one configured credential.
pub type PasswordMethod = fn(password: &str, stored: &str) -> Result<bool, PasswordError>;

/// Configured credential is the password itself.
pub fn plain(password: &str, stored: &str) -> Result<bool, PasswordError> {
    Ok(constant_time_eq(password.as_bytes(), stored.as_bytes()))
}

/// Configured credential is a bcrypt hash (`$2b$...`).
pub fn bcrypt_plain(password: &str, stored: &str) -> Result<bool, PasswordError> {
    Ok(bcrypt::verify(password, stored)?)
}

/// Configured credential is a base64 encoded bcrypt hash, which survives JSON and shell quoting.
pub fn bcrypt64(password: &str, stored: &str) -> Result<bool, PasswordError> {
    let decoded = STANDARD
        .decode(stored.trim())
        .map_err(|e| PasswordError::MalformedHash(e.to_string()))?;
    let decoded =
        String::from_utf8(decoded).map_err(|e| PasswordError::MalformedHash(e.to_string()))?;
    bcrypt_plain(password, &decoded)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
