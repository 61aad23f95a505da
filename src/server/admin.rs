//! `/admin/*` routes. Every handler takes an [`AdminUser`], so non-admins
//! get 403 before any work is done.

use std::str::FromStr;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
};
use serde::Deserialize;

use super::api::SharedState;
use super::auth::AdminUser;
use super::extract::{Json, Path, Query};
use super::models::{MAX_TITLE_LEN, Role, UserQuery};
use crate::errors::ServiceError;

const USER_NOT_FOUND: &str = "User not found";
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Deserialize)]
pub struct ListUsersParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub role: Option<String>,
}

impl ListUsersParams {
    fn into_query(self) -> Result<UserQuery, ServiceError> {
        let page = self.page.unwrap_or(1);
        let limit = self.limit.unwrap_or(10);
        if page < 1 {
            return Err(ServiceError::BadRequest("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ServiceError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(UserQuery {
            page,
            limit,
            search: self.search,
            role: self.role,
        })
    }
}

#[derive(Deserialize)]
pub struct AdminUpdateUser {
    pub name: Option<String>,
    pub role: Option<String>,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route(
            "/admin/users/{id}",
            patch(update_user).delete(delete_user),
        )
        .route("/admin/users/{id}/details", get(user_details))
}

async fn list_users(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<ListUsersParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let query = params.into_query()?;
    let users = state.db.call(move |db| db.list_users(&query)).await?;
    Ok(Json(serde_json::json!({ "users": users })))
}

async fn user_details(
    State(state): State<SharedState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.db.call(move |db| db.get_user_details(id)).await?;
    match details {
        Some(details) => Ok(Json(details)),
        None => Err(ServiceError::NotFound(USER_NOT_FOUND.to_string())),
    }
}

async fn update_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<AdminUpdateUser>,
) -> Result<impl IntoResponse, ServiceError> {
    let role = req
        .role
        .as_deref()
        .map(Role::from_str)
        .transpose()
        .map_err(ServiceError::BadRequest)?;
    let name = req.name.map(|n| n.trim().to_string());
    if let Some(ref n) = name
        && (n.is_empty() || n.chars().count() > MAX_TITLE_LEN)
    {
        return Err(ServiceError::BadRequest(format!(
            "Name must be 1 to {} characters",
            MAX_TITLE_LEN
        )));
    }

    let details = state
        .db
        .call(move |db| {
            if db.get_user(id)?.is_none() {
                return Err(ServiceError::NotFound(USER_NOT_FOUND.to_string()).into());
            }
            if let Some(ref name) = name {
                db.update_user_name(id, name)?;
            }
            if let Some(role) = role {
                db.set_user_role(id, role)?;
            }
            db.get_user_details(id)?
                .ok_or_else(|| ServiceError::NotFound(USER_NOT_FOUND.to_string()).into())
        })
        .await?;

    tracing::info!(admin = %admin.email, user_id = id, role = details.user.role.as_str(), "user updated by admin");
    Ok(Json(details))
}

async fn delete_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let deleted = state
        .db
        .call(move |db| {
            let Some(user) = db.get_user(id)? else {
                return Ok(None);
            };
            db.delete_user(id)?;
            Ok(Some(user.email))
        })
        .await?;
    match deleted {
        Some(email) => {
            tracing::info!(admin = %admin.email, user = %email, "user deleted by admin");
            state.hub.auth_update(&email, false);
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ServiceError::NotFound(USER_NOT_FOUND.to_string())),
    }
}
