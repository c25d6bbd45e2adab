//! Signed token issuance and verification.
//!
//! Two credential families live here:
//!
//! 1. HS256 JWTs carrying a `purpose` claim: long-lived `access` tokens
//!    returned at login and short-lived `attendance` tokens embedded in QR
//!    codes. Verification is purpose-scoped, so a token that passes the
//!    signature check but was issued for another purpose is rejected.
//! 2. Password-reset tokens: 32 random bytes, hex-encoded. Only a SHA-256
//!    hash is ever persisted; the raw token travels once, in the reset
//!    email.
//!
//! Expiry is evaluated against a caller-supplied `now` rather than the
//! wall clock, keeping the checks deterministic under test.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// What a signed token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    /// Session credential returned by login.
    Access,
    /// Single attendance write, embedded in a QR code.
    AttendanceScan,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::Access => "access",
            TokenPurpose::AttendanceScan => "attendance",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token was issued for a different purpose")]
    WrongPurpose,
}

/// Claims carried by every signed token.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id the token was issued for.
    pub sub: String,
    /// Purpose string, see [`TokenPurpose::as_str`].
    pub purpose: String,
    /// Unique token id; two tokens issued in the same second still differ.
    pub jti: String,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration (Unix timestamp).
    pub exp: i64,
}

/// Sign a token binding the user id, the purpose, and an absolute expiry.
pub fn issue(
    secret: &str,
    user_id: &str,
    purpose: TokenPurpose,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    let claims = Claims {
        sub: user_id.to_string(),
        purpose: purpose.as_str().to_string(),
        jti: uuid::Uuid::new_v4().to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| TokenError::Malformed)
}

/// Verify signature, expiry, and purpose. No side effects.
pub fn verify(
    secret: &str,
    token: &str,
    expected: TokenPurpose,
    now: DateTime<Utc>,
) -> Result<Claims, TokenError> {
    // Expiry is checked below against the injected clock, not the
    // library's wall clock.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::BadSignature,
        _ => TokenError::Malformed,
    })?;

    let claims = data.claims;

    if now.timestamp() >= claims.exp {
        return Err(TokenError::Expired);
    }
    if claims.purpose != expected.as_str() {
        return Err(TokenError::WrongPurpose);
    }

    Ok(claims)
}

/// Generate a high-entropy password-reset token (raw form, hex-encoded).
pub fn generate_reset_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// One-way hash used to store reset tokens at rest.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
