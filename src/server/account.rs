//! `/auth/*` routes: registration, login, token refresh and account
//! management.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, patch, post},
};
use chrono::Utc;
use serde::Deserialize;

use super::api::SharedState;
use super::auth::{
    CurrentUser, TokenError, bearer_token, blocking, create_access_token, create_refresh_token,
    decode_access_token, decode_access_token_ignoring_expiry, decode_refresh_token, hash_password,
    hash_token, is_valid_email, normalize_email, verify_password,
};
use super::extract::{Form, Json};
use super::models::{MAX_TITLE_LEN, MIN_PASSWORD_LEN, TokenResponse, User};
use crate::errors::ServiceError;

const BAD_LOGIN: &str = "Incorrect email or password";

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

/// OAuth2 password-flow form; `username` carries the email.
#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdateNameRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

pub fn routes() -> axum::Router<SharedState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/refresh", post(refresh))
        .route("/auth/account", delete(delete_account))
        .route("/auth/update-name", patch(update_name))
        .route("/auth/change-password", patch(change_password))
}

fn check_password_strength(password: &str) -> Result<(), ServiceError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ServiceError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Mint an access/refresh pair and persist the refresh token's hash.
async fn issue_tokens(state: &SharedState, user: &User) -> Result<TokenResponse, ServiceError> {
    let now = Utc::now();
    let access_token = create_access_token(&state.config.auth, &user.email, now)?;
    let (refresh_token, expires_at) = create_refresh_token(&state.config.auth, &user.email, now)?;
    let token_hash = hash_token(&refresh_token);
    let user_id = user.id;
    state
        .db
        .call(move |db| db.store_refresh_token(user_id, &token_hash, expires_at))
        .await?;
    Ok(TokenResponse {
        access_token,
        refresh_token: Some(refresh_token),
        token_type: "bearer".to_string(),
        user_id: user.email.clone(),
        name: user.name.clone(),
    })
}

async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        return Err(ServiceError::BadRequest("Invalid email address".to_string()));
    }
    check_password_strength(&req.password)?;
    let name = req
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let password = req.password;
    let hashed = blocking(move || hash_password(&password)).await??;
    let new_email = email.clone();
    let user = state
        .db
        .call(move |db| db.create_user(&new_email, name.as_deref(), &hashed))
        .await?
        .ok_or_else(|| ServiceError::Conflict("Email already registered".to_string()))?;

    tracing::info!(user = %email, user_id = user.id, "user registered");
    let tokens = issue_tokens(&state, &user).await?;
    Ok((StatusCode::CREATED, Json(tokens)))
}

async fn login(
    State(state): State<SharedState>,
    Form(form): Form<LoginForm>,
) -> Result<impl IntoResponse, ServiceError> {
    let bad_login = || ServiceError::Unauthorized {
        message: BAD_LOGIN.to_string(),
        bearer_challenge: true,
    };
    let email = normalize_email(&form.username);
    let lookup = email.clone();
    let user = state
        .db
        .call(move |db| db.get_user_by_email(&lookup))
        .await?;
    let Some(user) = user else {
        tracing::info!(user = %email, "login failed: unknown email");
        return Err(bad_login());
    };

    let password = form.password;
    let hashed = user.hashed_password.clone();
    if !blocking(move || verify_password(&password, &hashed)).await? {
        tracing::info!(user = %email, "login failed: wrong password");
        return Err(bad_login());
    }

    tracing::info!(user = %email, "user logged in");
    Ok(Json(issue_tokens(&state, &user).await?))
}

async fn logout(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(ServiceError::Unauthorized {
            message: "Not authenticated".to_string(),
            bearer_challenge: true,
        });
    };
    let auth = &state.config.auth;
    let (claims, message) = match decode_access_token(auth, token) {
        Ok(claims) => (claims, "Successfully logged out"),
        Err(TokenError::Expired) => match decode_access_token_ignoring_expiry(auth, token) {
            Ok(claims) => (claims, "Session expired, logged out"),
            Err(_) => return Err(ServiceError::unauthorized("Invalid token")),
        },
        Err(TokenError::Invalid) => return Err(ServiceError::unauthorized("Invalid token")),
    };

    let email = claims.sub;
    let lookup = email.clone();
    let revoked = state
        .db
        .call(move |db| match db.get_user_by_email(&lookup)? {
            Some(user) => db.revoke_all_refresh_tokens(user.id),
            None => Ok(0),
        })
        .await?;

    tracing::info!(user = %email, revoked, "user logged out");
    state.hub.auth_update(&email, false);
    Ok(Json(serde_json::json!({"message": message})))
}

async fn refresh(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let invalid = || ServiceError::unauthorized("Invalid refresh token");
    let revoked = || ServiceError::unauthorized("Refresh token revoked or expired");

    let token = bearer_token(&headers).ok_or_else(invalid)?;
    let auth = &state.config.auth;
    let claims = match decode_refresh_token(auth, token) {
        Ok(claims) => claims,
        Err(TokenError::Expired) => {
            return Err(ServiceError::unauthorized("Refresh token expired"));
        }
        Err(TokenError::Invalid) => return Err(invalid()),
    };

    let email = claims.sub;
    let lookup = email.clone();
    let old_hash = hash_token(token);
    let check_hash = old_hash.clone();
    let now = Utc::now();
    let (user, stored_expiry) = state
        .db
        .call(move |db| {
            let Some(user) = db.get_user_by_email(&lookup)? else {
                return Ok((None, None));
            };
            let expiry = db.find_refresh_token(user.id, &check_hash)?;
            Ok((Some(user), expiry))
        })
        .await?;
    let user = user.ok_or_else(invalid)?;
    match stored_expiry {
        Some(expires_at) if expires_at > now => {}
        _ => {
            tracing::warn!(user = %email, "refresh with revoked or expired token");
            return Err(revoked());
        }
    }

    let access_token = create_access_token(auth, &email, now)?;
    let refresh_token = if auth.refresh_token_rotation {
        let (new_token, expires_at) = create_refresh_token(auth, &email, now)?;
        let new_hash = hash_token(&new_token);
        let user_id = user.id;
        let rotated = state
            .db
            .call(move |db| db.rotate_refresh_token(user_id, &old_hash, &new_hash, expires_at))
            .await?;
        if !rotated {
            // Another request rotated the same token first.
            return Err(revoked());
        }
        Some(new_token)
    } else {
        None
    };

    tracing::info!(user = %email, rotated = refresh_token.is_some(), "tokens refreshed");
    Ok(Json(TokenResponse {
        access_token,
        refresh_token,
        token_type: "bearer".to_string(),
        user_id: email,
        name: user.name,
    }))
}

async fn delete_account(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user.id;
    state.db.call(move |db| db.delete_user(user_id)).await?;
    tracing::info!(user = %user.email, user_id, "account deleted");
    state.hub.auth_update(&user.email, false);
    Ok(StatusCode::NO_CONTENT)
}

async fn update_name(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<UpdateNameRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ServiceError::BadRequest("Name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_TITLE_LEN {
        return Err(ServiceError::BadRequest(format!(
            "Name must be at most {} characters",
            MAX_TITLE_LEN
        )));
    }
    let user_id = user.id;
    let updated = state
        .db
        .call(move |db| db.update_user_name(user_id, &name))
        .await?;
    tracing::info!(user = %updated.email, "name updated");
    Ok(Json(serde_json::json!({
        "email": updated.email,
        "name": updated.name,
    })))
}

async fn change_password(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let current = req.current_password;
    let hashed = user.hashed_password.clone();
    if !blocking(move || verify_password(&current, &hashed)).await? {
        return Err(ServiceError::BadRequest(
            "Incorrect current password".to_string(),
        ));
    }
    check_password_strength(&req.new_password)?;

    let new_password = req.new_password;
    let new_hash = blocking(move || hash_password(&new_password)).await??;
    let user_id = user.id;
    state
        .db
        .call(move |db| db.update_password(user_id, &new_hash))
        .await?;

    tracing::info!(user = %user.email, "password changed; sessions revoked");
    state.hub.auth_update(&user.email, false);
    Ok(Json(serde_json::json!({
        "message": "Password changed successfully. Please log in again."
    })))
}
