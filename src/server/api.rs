use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use super::auth::CurrentUser;
use super::db::DbHandle;
use super::extract::{Json, Path, Query};
use super::models::*;
use super::push::PushSender;
use super::ws::{WsHub, WsMessage};
use super::{account, admin, notifications};
use crate::config::LosConfig;
use crate::errors::ServiceError;

const GOAL_NOT_FOUND: &str = "Goal not found or not authorized";
const TASK_NOT_FOUND: &str = "Task not found or not authorized";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub config: Arc<LosConfig>,
    pub hub: WsHub,
    pub push: Arc<dyn PushSender>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Today's date at the configured UTC offset.
    pub fn local_today(&self) -> NaiveDate {
        self.local_date(Utc::now())
    }

    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.config.reminders.utc_offset)
            .date_naive()
    }
}

// ── Error handling ────────────────────────────────────────────────────

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message, challenge) = match self {
            ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, false),
            ServiceError::BadRequest(msg) | ServiceError::Conflict(msg) => {
                (StatusCode::BAD_REQUEST, msg, false)
            }
            ServiceError::Unauthorized {
                message,
                bearer_challenge,
            } => (StatusCode::UNAUTHORIZED, message, bearer_challenge),
            ServiceError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, false),
            ServiceError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, false),
        };
        let body = Json(serde_json::json!({"detail": message}));
        if challenge {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct GoalQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct TaskQuery {
    pub status: Option<String>,
    pub filter: Option<String>,
    pub goal_id: Option<i64>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/goals", get(list_goals).post(create_goal))
        .route(
            "/goals/{id}",
            get(get_goal).put(update_goal).delete(delete_goal),
        )
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/progress", get(get_progress))
        .route(
            "/preferences",
            get(get_preferences).patch(update_preferences),
        )
        .merge(account::routes())
        .merge(notifications::routes())
        .merge(admin::routes())
}

// ── Helpers ───────────────────────────────────────────────────────────

fn bad_request(msg: String) -> ServiceError {
    ServiceError::BadRequest(msg)
}

fn category_limit() -> ServiceError {
    ServiceError::Conflict(format!(
        "Maximum {} active goals allowed per category",
        MAX_ACTIVE_GOALS_PER_CATEGORY
    ))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({"Hello": "World"}))
}

async fn health_check() -> &'static str {
    "ok"
}

// Goals

async fn list_goals(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<GoalQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = query
        .status
        .as_deref()
        .map(GoalStatus::from_str)
        .transpose()
        .map_err(bad_request)?;
    let goals = state
        .db
        .call(move |db| db.list_goals(user.id, status))
        .await?;
    let today = state.local_today();
    let goals: Vec<Goal> = goals
        .into_iter()
        .map(|g| g.with_days_remaining(today))
        .collect();
    Ok(Json(goals))
}

async fn create_goal(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateGoalRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let category = GoalCategory::from_str(&req.category).map_err(bad_request)?;
    validate_title(&req.title).map_err(bad_request)?;
    if let Some(ref d) = req.description {
        validate_description(d).map_err(bad_request)?;
    }
    let title = req.title.trim().to_string();
    let description = req.description;
    let target_date = req.target_date;
    let status = req.status.unwrap_or(GoalStatus::Active);
    let user_id = user.id;

    let goal = state
        .db
        .call(move |db| {
            if status == GoalStatus::Active
                && db.count_active_goals(user_id, category, None)? >= MAX_ACTIVE_GOALS_PER_CATEGORY
            {
                return Err(category_limit().into());
            }
            db.create_goal(
                user_id,
                &title,
                description.as_deref(),
                category,
                status,
                target_date,
            )
        })
        .await?
        .with_days_remaining(state.local_today());

    tracing::info!(user = %user.email, goal_id = goal.id, category = category.as_str(), "goal created");
    state
        .hub
        .send_to(&user.email, &WsMessage::GoalCreated { goal: goal.clone() });
    Ok((StatusCode::CREATED, Json(goal)))
}

async fn get_goal(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let goal = state.db.call(move |db| db.get_goal(id)).await?;
    match goal.filter(|g| g.user_id == user.id) {
        Some(goal) => Ok(Json(goal.with_days_remaining(state.local_today()))),
        None => Err(ServiceError::NotFound(GOAL_NOT_FOUND.to_string())),
    }
}

async fn update_goal(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateGoalRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(ref t) = req.title {
        validate_title(t).map_err(bad_request)?;
    }
    if let Some(Some(ref d)) = req.description {
        validate_description(d).map_err(bad_request)?;
    }
    let user_id = user.id;

    let (goal, changed) = state
        .db
        .call(move |db| {
            let mut goal = db
                .get_goal(id)?
                .filter(|g| g.user_id == user_id)
                .ok_or_else(|| ServiceError::NotFound(GOAL_NOT_FOUND.to_string()))?;
            let mut changed = false;

            if let Some(title) = req.title.map(|t| t.trim().to_string())
                && title != goal.title
            {
                goal.title = title;
                changed = true;
            }
            if let Some(description) = req.description
                && description != goal.description
            {
                goal.description = description;
                changed = true;
            }
            if let Some(target_date) = req.target_date
                && target_date != goal.target_date
            {
                goal.target_date = target_date;
                changed = true;
            }
            if let Some(status) = req.status
                && status != goal.status
            {
                if status == GoalStatus::Active
                    && db.count_active_goals(user_id, goal.category, Some(goal.id))?
                        >= MAX_ACTIVE_GOALS_PER_CATEGORY
                {
                    return Err(category_limit().into());
                }
                goal.completed_at = match status {
                    GoalStatus::Completed => Some(Utc::now()),
                    GoalStatus::Active => None,
                };
                goal.status = status;
                changed = true;
            }

            if !changed {
                return Ok((goal, false));
            }
            Ok((db.save_goal(&goal)?, true))
        })
        .await?;

    let goal = goal.with_days_remaining(state.local_today());
    if changed {
        tracing::info!(user = %user.email, goal_id = goal.id, status = goal.status.as_str(), "goal updated");
        state
            .hub
            .send_to(&user.email, &WsMessage::GoalUpdated { goal: goal.clone() });
    }
    Ok(Json(goal))
}

async fn delete_goal(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user.id;
    state
        .db
        .call(move |db| {
            if db.get_goal(id)?.filter(|g| g.user_id == user_id).is_none() {
                return Err(ServiceError::NotFound(GOAL_NOT_FOUND.to_string()).into());
            }
            db.delete_goal(id)
        })
        .await?;
    tracing::info!(user = %user.email, goal_id = id, "goal deleted");
    state
        .hub
        .send_to(&user.email, &WsMessage::GoalDeleted { goal_id: id });
    Ok(StatusCode::NO_CONTENT)
}

// Tasks

async fn list_tasks(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<TaskQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()
        .map_err(bad_request)?;
    let today_only = match query.filter.as_deref() {
        None | Some("") => false,
        Some("today") => true,
        Some(other) => {
            return Err(ServiceError::BadRequest(format!(
                "Invalid filter value: {}. Allowed values are today",
                other
            )));
        }
    };
    let goal_id = query.goal_id;
    let tasks = state
        .db
        .call(move |db| db.list_tasks(user.id, goal_id, status))
        .await?;
    let today = state.local_today();
    let tasks: Vec<Task> = tasks
        .into_iter()
        .filter(|t| !today_only || state.local_date(t.created_at) == today)
        .collect();
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_title(&req.title).map_err(bad_request)?;
    let title = req.title.trim().to_string();
    let goal_id = req.goal_id;
    let status = req.status.unwrap_or(TaskStatus::Pending);
    let user_id = user.id;

    let task = state
        .db
        .call(move |db| {
            if db.get_goal(goal_id)?.filter(|g| g.user_id == user_id).is_none() {
                return Err(ServiceError::BadRequest(GOAL_NOT_FOUND.to_string()).into());
            }
            db.create_task(user_id, goal_id, &title, status)
        })
        .await?;

    tracing::info!(user = %user.email, task_id = task.id, goal_id, "task created");
    state
        .hub
        .send_to(&user.email, &WsMessage::TaskCreated { task: task.clone() });
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = state.db.call(move |db| db.get_task(id)).await?;
    match task.filter(|t| t.user_id == user.id) {
        Some(task) => Ok(Json(task)),
        None => Err(ServiceError::NotFound(TASK_NOT_FOUND.to_string())),
    }
}

async fn update_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(ref t) = req.title {
        validate_title(t).map_err(bad_request)?;
    }
    let title = req.title.map(|t| t.trim().to_string());
    let status = req.status;
    let user_id = user.id;

    let task = state
        .db
        .call(move |db| {
            if db.get_task(id)?.filter(|t| t.user_id == user_id).is_none() {
                return Err(ServiceError::NotFound(TASK_NOT_FOUND.to_string()).into());
            }
            db.update_task(id, title.as_deref(), status)
        })
        .await?;

    tracing::info!(user = %user.email, task_id = id, status = task.status.as_str(), "task updated");
    state
        .hub
        .send_to(&user.email, &WsMessage::TaskUpdated { task: task.clone() });
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user.id;
    state
        .db
        .call(move |db| {
            if db.get_task(id)?.filter(|t| t.user_id == user_id).is_none() {
                return Err(ServiceError::NotFound(TASK_NOT_FOUND.to_string()).into());
            }
            db.delete_task(id)
        })
        .await?;
    tracing::info!(user = %user.email, task_id = id, "task deleted");
    state
        .hub
        .send_to(&user.email, &WsMessage::TaskDeleted { task_id: id });
    Ok(StatusCode::NO_CONTENT)
}

// Progress

async fn get_progress(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user.id;
    let (categories, tasks) = state
        .db
        .call(move |db| {
            Ok((
                db.category_progress(user_id)?,
                db.list_tasks(user_id, None, None)?,
            ))
        })
        .await?;

    let today = state.local_today();
    let todays: Vec<&Task> = tasks
        .iter()
        .filter(|t| state.local_date(t.created_at) == today)
        .collect();
    let tasks_today = todays.len() as i64;
    let tasks_completed_today = todays
        .iter()
        .filter(|t| t.status == TaskStatus::Complete)
        .count() as i64;
    let completion_rate_today = if tasks_today == 0 {
        0.0
    } else {
        tasks_completed_today as f64 / tasks_today as f64
    };

    Ok(Json(ProgressSummary {
        categories,
        tasks_today,
        tasks_completed_today,
        completion_rate_today,
    }))
}

// Preferences

async fn get_preferences(CurrentUser(user): CurrentUser) -> impl IntoResponse {
    Json(user.preferences)
}

async fn update_preferences(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<PreferencesUpdate>,
) -> Result<impl IntoResponse, ServiceError> {
    if update.is_empty() {
        return Ok(Json(user.preferences));
    }
    update.validate().map_err(bad_request)?;
    let user_id = user.id;
    let preferences = state
        .db
        .call(move |db| db.update_preferences(user_id, &update))
        .await?;
    tracing::info!(user = %user.email, notifications = preferences.notifications_enabled, "preferences updated");
    state.hub.send_to(
        &user.email,
        &WsMessage::PreferencesUpdated {
            preferences: preferences.clone(),
        },
    );
    Ok(Json(preferences))
}

// ── Test support ──────────────────────────────────────────────────────

#[cfg(test)]
pub fn test_state_with_push(push: Arc<dyn PushSender>) -> SharedState {
    use super::db::LosDb;
    let db = match LosDb::new_in_memory() {
        Ok(db) => db,
        Err(e) => panic!("in-memory database: {:#}", e),
    };
    Arc::new(AppState {
        db: DbHandle::new(db),
        config: Arc::new(LosConfig::for_tests()),
        hub: WsHub::new(64),
        push,
    })
}

#[cfg(test)]
pub fn test_state() -> SharedState {
    test_state_with_push(Arc::new(super::push::DisabledPushSender))
}

/// Create a user directly and return it with a valid access token.
#[cfg(test)]
pub fn seed_user(state: &SharedState, email: &str, password: &str) -> (User, String) {
    use super::auth::{create_access_token, hash_password};
    let hash = hash_password(password).unwrap();
    let user = state
        .db
        .lock_sync()
        .unwrap()
        .create_user(email, Some("Test User"), &hash)
        .unwrap()
        .unwrap();
    let token = create_access_token(&state.config.auth, email, Utc::now()).unwrap();
    (user, token)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::create_access_token;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(state: &SharedState) -> Router {
        api_router().with_state(state.clone())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", format!("Bearer {}", token));
        match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn create_goal_via_api(
        state: &SharedState,
        token: &str,
        title: &str,
        category: &str,
    ) -> Response {
        app(state)
            .oneshot(authed(
                "POST",
                "/goals",
                token,
                Some(serde_json::json!({"title": title, "category": category})),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let state = test_state();
        let response = app(&state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["Hello"], "World");

        let response = app(&state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_protected_route_without_token() {
        let state = test_state();
        let response = app(&state)
            .oneshot(Request::builder().uri("/goals").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["detail"], "Not authenticated");
    }

    #[tokio::test]
    async fn test_expired_token_is_reported() {
        let state = test_state();
        seed_user(&state, "ada@example.com", "password123");
        let issued = Utc::now() - chrono::Duration::hours(2);
        let token = create_access_token(&state.config.auth, "ada@example.com", issued).unwrap();
        let response = app(&state)
            .oneshot(authed("GET", "/goals", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["detail"], "Token has expired");
    }

    #[tokio::test]
    async fn test_token_for_deleted_user_is_rejected() {
        let state = test_state();
        let (user, token) = seed_user(&state, "ada@example.com", "password123");
        state.db.lock_sync().unwrap().delete_user(user.id).unwrap();
        let response = app(&state)
            .oneshot(authed("GET", "/goals", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["detail"], "Could not validate credentials");
    }

    #[tokio::test]
    async fn test_create_and_get_goal() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let target = (Utc::now() + chrono::Duration::days(30)).date_naive();

        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/goals",
                &token,
                Some(serde_json::json!({
                    "title": "  Run a marathon ",
                    "category": "Health",
                    "target_date": target.to_string(),
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.title, "Run a marathon");
        assert_eq!(goal.status, GoalStatus::Active);
        assert!(goal.days_remaining.is_some());

        let response = app(&state)
            .oneshot(authed("GET", &format!("/goals/{}", goal.id), &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_goal_update_clears_nullable_fields() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let target = (Utc::now() + chrono::Duration::days(30)).date_naive();
        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/goals",
                &token,
                Some(serde_json::json!({
                    "title": "Run",
                    "description": "Sub-30 5k",
                    "category": "Health",
                    "target_date": target.to_string(),
                })),
            ))
            .await
            .unwrap();
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.description.as_deref(), Some("Sub-30 5k"));

        // Absent keys leave the fields alone.
        let response = app(&state)
            .oneshot(authed(
                "PUT",
                &format!("/goals/{}", goal.id),
                &token,
                Some(serde_json::json!({"title": "Run more"})),
            ))
            .await
            .unwrap();
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.description.as_deref(), Some("Sub-30 5k"));
        assert_eq!(goal.target_date, Some(target));

        let response = app(&state)
            .oneshot(authed(
                "PUT",
                &format!("/goals/{}", goal.id),
                &token,
                Some(serde_json::json!({"description": null, "target_date": null})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.description, None);
        assert_eq!(goal.target_date, None);
        assert_eq!(goal.days_remaining, None);

        let stored = state.db.lock_sync().unwrap().get_goal(goal.id).unwrap().unwrap();
        assert_eq!(stored.description, None);
        assert_eq!(stored.target_date, None);
    }

    #[tokio::test]
    async fn test_unknown_enum_value_uses_detail_body() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Run", "Health").await;
        let goal: Goal = body_json(response.into_body()).await;

        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/tasks",
                &token,
                Some(serde_json::json!({"goal_id": goal.id, "title": "Jog", "status": "done"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert!(json["detail"].as_str().unwrap().contains("done"));
    }

    #[tokio::test]
    async fn test_missing_field_uses_detail_body() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/goals",
                &token,
                Some(serde_json::json!({"category": "Health"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert!(json["detail"].as_str().unwrap().contains("missing field `title`"));
    }

    #[tokio::test]
    async fn test_non_numeric_path_id_uses_detail_body() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = app(&state)
            .oneshot(authed("GET", "/goals/abc", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_json_uses_detail_body() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let request = Request::builder()
            .method("POST")
            .uri("/goals")
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn test_create_goal_rejects_unknown_category() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Paint", "Hobbies").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_category_limit_on_create_and_reactivate() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let mut ids = Vec::new();
        for i in 0..3 {
            let response = create_goal_via_api(&state, &token, &format!("Goal {}", i), "Work").await;
            assert_eq!(response.status(), StatusCode::CREATED);
            let goal: Goal = body_json(response.into_body()).await;
            ids.push(goal.id);
        }
        let response = create_goal_via_api(&state, &token, "One too many", "Work").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["detail"], "Maximum 3 active goals allowed per category");

        // Other categories are unaffected.
        let response = create_goal_via_api(&state, &token, "Call mom", "Family").await;
        assert_eq!(response.status(), StatusCode::CREATED);

        // Completing one frees a slot; reactivating it once the slot is
        // taken again is refused.
        let uri = format!("/goals/{}", ids[0]);
        let response = app(&state)
            .oneshot(authed("PUT", &uri, &token, Some(serde_json::json!({"status": "completed"}))))
            .await
            .unwrap();
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.status, GoalStatus::Completed);
        assert!(goal.completed_at.is_some());

        let response = create_goal_via_api(&state, &token, "Replacement", "Work").await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app(&state)
            .oneshot(authed("PUT", &uri, &token, Some(serde_json::json!({"status": "active"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reactivating_goal_clears_completed_at() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Read", "Personal").await;
        let goal: Goal = body_json(response.into_body()).await;
        let uri = format!("/goals/{}", goal.id);

        app(&state)
            .oneshot(authed("PUT", &uri, &token, Some(serde_json::json!({"status": "completed"}))))
            .await
            .unwrap();
        let response = app(&state)
            .oneshot(authed("PUT", &uri, &token, Some(serde_json::json!({"status": "active"}))))
            .await
            .unwrap();
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.status, GoalStatus::Active);
        assert!(goal.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_noop_goal_update_keeps_updated_at() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Read", "Personal").await;
        let created: Goal = body_json(response.into_body()).await;

        let response = app(&state)
            .oneshot(authed(
                "PUT",
                &format!("/goals/{}", created.id),
                &token,
                Some(serde_json::json!({"title": "Read", "category": "Work"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let goal: Goal = body_json(response.into_body()).await;
        assert_eq!(goal.updated_at, created.updated_at);
        assert_eq!(goal.category, GoalCategory::Personal);
    }

    #[tokio::test]
    async fn test_goals_are_private_to_owner() {
        let state = test_state();
        let (_, ada) = seed_user(&state, "ada@example.com", "password123");
        let (_, bob) = seed_user(&state, "bob@example.com", "password123");
        let response = create_goal_via_api(&state, &ada, "Secret", "Personal").await;
        let goal: Goal = body_json(response.into_body()).await;
        let uri = format!("/goals/{}", goal.id);

        for method in ["GET", "DELETE"] {
            let response = app(&state).oneshot(authed(method, &uri, &bob, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let json: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(json["detail"], GOAL_NOT_FOUND);
        }

        let response = app(&state)
            .oneshot(authed("GET", "/goals", &bob, None))
            .await
            .unwrap();
        let goals: Vec<Goal> = body_json(response.into_body()).await;
        assert!(goals.is_empty());
    }

    #[tokio::test]
    async fn test_list_goals_status_filter() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        create_goal_via_api(&state, &token, "A", "Work").await;
        let response = app(&state)
            .oneshot(authed("GET", "/goals?status=completed", &token, None))
            .await
            .unwrap();
        let goals: Vec<Goal> = body_json(response.into_body()).await;
        assert!(goals.is_empty());

        let response = app(&state)
            .oneshot(authed("GET", "/goals?status=archived", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_goal_broadcasts_and_removes_tasks() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Run", "Health").await;
        let goal: Goal = body_json(response.into_body()).await;
        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/tasks",
                &token,
                Some(serde_json::json!({"goal_id": goal.id, "title": "Jog"})),
            ))
            .await
            .unwrap();
        let task: Task = body_json(response.into_body()).await;

        let mut rx = state.hub.subscribe();
        let response = app(&state)
            .oneshot(authed("DELETE", &format!("/goals/{}", goal.id), &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.user, "ada@example.com");
        assert!(envelope.payload.contains("goal_deleted"));

        let response = app(&state)
            .oneshot(authed("GET", &format!("/tasks/{}", task.id), &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Run", "Health").await;
        let goal: Goal = body_json(response.into_body()).await;

        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/tasks",
                &token,
                Some(serde_json::json!({"goal_id": goal.id, "title": "Jog 5km"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task: Task = body_json(response.into_body()).await;
        assert_eq!(task.status, TaskStatus::Pending);

        let response = app(&state)
            .oneshot(authed(
                "PUT",
                &format!("/tasks/{}", task.id),
                &token,
                Some(serde_json::json!({"status": "completed"})),
            ))
            .await
            .unwrap();
        let task: Task = body_json(response.into_body()).await;
        assert_eq!(task.status, TaskStatus::Complete);

        let response = app(&state)
            .oneshot(authed("GET", "/tasks?status=complete&filter=today", &token, None))
            .await
            .unwrap();
        let tasks: Vec<Task> = body_json(response.into_body()).await;
        assert_eq!(tasks.len(), 1);

        let response = app(&state)
            .oneshot(authed("DELETE", &format!("/tasks/{}", task.id), &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_task_for_foreign_goal_is_rejected() {
        let state = test_state();
        let (_, ada) = seed_user(&state, "ada@example.com", "password123");
        let (_, bob) = seed_user(&state, "bob@example.com", "password123");
        let response = create_goal_via_api(&state, &ada, "Run", "Health").await;
        let goal: Goal = body_json(response.into_body()).await;

        let response = app(&state)
            .oneshot(authed(
                "POST",
                "/tasks",
                &bob,
                Some(serde_json::json!({"goal_id": goal.id, "title": "Sneaky"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["detail"], GOAL_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_tasks_rejects_unknown_status() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = app(&state)
            .oneshot(authed("GET", "/tasks?status=done", &token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert!(json["detail"].as_str().unwrap().contains("pending, complete, incomplete"));
    }

    #[tokio::test]
    async fn test_progress_summary() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");
        let response = create_goal_via_api(&state, &token, "Run", "Health").await;
        let goal: Goal = body_json(response.into_body()).await;
        for (title, status) in [("Jog", "complete"), ("Swim", "pending")] {
            app(&state)
                .oneshot(authed(
                    "POST",
                    "/tasks",
                    &token,
                    Some(serde_json::json!({"goal_id": goal.id, "title": title, "status": status})),
                ))
                .await
                .unwrap();
        }

        let response = app(&state)
            .oneshot(authed("GET", "/progress", &token, None))
            .await
            .unwrap();
        let summary: ProgressSummary = body_json(response.into_body()).await;
        assert_eq!(summary.categories.len(), 4);
        assert_eq!(summary.tasks_today, 2);
        assert_eq!(summary.tasks_completed_today, 1);
        assert!((summary.completion_rate_today - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_preferences_get_and_patch() {
        let state = test_state();
        let (_, token) = seed_user(&state, "ada@example.com", "password123");

        let response = app(&state)
            .oneshot(authed("GET", "/preferences", &token, None))
            .await
            .unwrap();
        let prefs: Preferences = body_json(response.into_body()).await;
        assert_eq!(prefs, Preferences::default());

        let response = app(&state)
            .oneshot(authed(
                "PATCH",
                "/preferences",
                &token,
                Some(serde_json::json!({"morning_deadline": "07:30 AM", "notifications_enabled": true})),
            ))
            .await
            .unwrap();
        let prefs: Preferences = body_json(response.into_body()).await;
        assert_eq!(prefs.morning_deadline, "07:30 AM");
        assert!(prefs.notifications_enabled);
        assert_eq!(prefs.evening_deadline, "10:00 PM");

        let response = app(&state)
            .oneshot(authed(
                "PATCH",
                "/preferences",
                &token,
                Some(serde_json::json!({"evening_deadline": "25:00 PM"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(&state)
            .oneshot(authed("PATCH", "/preferences", &token, Some(serde_json::json!({}))))
            .await
            .unwrap();
        let prefs: Preferences = body_json(response.into_body()).await;
        assert_eq!(prefs.morning_deadline, "07:30 AM");
    }
}
