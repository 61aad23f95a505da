//! Credentials and tokens.
//!
//! Access and refresh tokens are HMAC-signed JWTs with distinct secrets.
//! Refresh tokens are additionally persisted (as SHA-256 hashes) so they
//! can be revoked. Protected handlers take a [`CurrentUser`] (or
//! [`AdminUser`]) extractor argument.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::api::SharedState;
use super::models::{Role, User};
use crate::config::AuthConfig;
use crate::errors::ServiceError;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("email regex is valid")
});

/// Lowercase and trim an email so lookups are case-insensitive.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_RE.is_match(email)
}

// ── Passwords ─────────────────────────────────────────────────────────

/// Hash a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to encode salt: {}", e))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// A malformed stored hash verifies as `false`.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    match PasswordHash::new(hashed) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Run Argon2 work off the async executor.
pub async fn blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Password hashing task panicked")
}

// ── Tokens ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Normalized user email.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    /// Unique per token, so two tokens minted in the same second differ.
    pub jti: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Invalid,
}

fn mint(
    cfg: &AuthConfig,
    secret: &str,
    subject: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<(String, DateTime<Utc>)> {
    let expires_at = now
        .checked_add_signed(ttl)
        .context("Token expiry is out of range")?;
    let claims = Claims {
        sub: subject.to_string(),
        exp: expires_at.timestamp(),
        iat: now.timestamp(),
        jti: uuid::Uuid::new_v4().to_string(),
    };
    let token = encode(
        &Header::new(cfg.algorithm),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to sign token")?;
    Ok((token, expires_at))
}

pub fn create_access_token(cfg: &AuthConfig, email: &str, now: DateTime<Utc>) -> Result<String> {
    mint(cfg, &cfg.secret_key, email, now, cfg.access_token_ttl).map(|(t, _)| t)
}

/// Returns the token together with its expiry, which is what gets stored.
pub fn create_refresh_token(
    cfg: &AuthConfig,
    email: &str,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>)> {
    mint(cfg, &cfg.refresh_secret_key, email, now, cfg.refresh_token_ttl)
}

fn verify(
    cfg: &AuthConfig,
    secret: &str,
    token: &str,
    check_expiry: bool,
) -> Result<Claims, TokenError> {
    let mut validation = Validation::new(cfg.algorithm);
    validation.leeway = 0;
    validation.validate_exp = check_expiry;
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    })
}

pub fn decode_access_token(cfg: &AuthConfig, token: &str) -> Result<Claims, TokenError> {
    verify(cfg, &cfg.secret_key, token, true)
}

/// Signature-only check, used by logout so an expired session can still
/// revoke its refresh tokens.
pub fn decode_access_token_ignoring_expiry(
    cfg: &AuthConfig,
    token: &str,
) -> Result<Claims, TokenError> {
    verify(cfg, &cfg.secret_key, token, false)
}

pub fn decode_refresh_token(cfg: &AuthConfig, token: &str) -> Result<Claims, TokenError> {
    verify(cfg, &cfg.refresh_secret_key, token, true)
}

/// Storage key for a refresh token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// The credentials of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

// ── Extractors ────────────────────────────────────────────────────────

/// The authenticated user behind a Bearer access token.
pub struct CurrentUser(pub User);

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            return Err(ServiceError::Unauthorized {
                message: "Not authenticated".to_string(),
                bearer_challenge: true,
            });
        };
        let claims = match decode_access_token(&state.config.auth, token) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                return Err(ServiceError::unauthorized("Token has expired"));
            }
            Err(TokenError::Invalid) => return Err(ServiceError::credentials()),
        };
        let email = claims.sub;
        let user = state
            .db
            .call(move |db| db.get_user_by_email(&email))
            .await?;
        user.map(CurrentUser).ok_or_else(ServiceError::credentials)
    }
}

/// A [`CurrentUser`] whose role is admin.
pub struct AdminUser(pub User);

impl FromRequestParts<SharedState> for AdminUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if user.role != Role::Admin {
            return Err(ServiceError::Forbidden("Admin access required".to_string()));
        }
        Ok(AdminUser(user))
    }
}
