//! `/notifications/*` routes: Web Push subscription management and test
//! deliveries.

use axum::{
    Router,
    extract::State,
    response::IntoResponse,
    routing::{delete, get, post},
};

use super::api::SharedState;
use super::auth::CurrentUser;
use super::extract::Json;
use super::models::{Notification, PushSubscriptionRequest, ReminderKind, User};
use crate::errors::ServiceError;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/notifications/subscribe", post(subscribe))
        .route("/notifications/subscription", get(get_subscription))
        .route("/notifications/unsubscribe", delete(unsubscribe))
        .route("/notifications/send-test", post(send_test))
        .route(
            "/notifications/test-morning-reminder",
            post(test_morning_reminder),
        )
        .route(
            "/notifications/test-evening-reminder",
            post(test_evening_reminder),
        )
}

fn validate_subscription(req: &PushSubscriptionRequest) -> Result<(), ServiceError> {
    let endpoint_ok = reqwest::Url::parse(&req.endpoint)
        .map(|u| u.scheme() == "https")
        .unwrap_or(false);
    if !endpoint_ok {
        return Err(ServiceError::BadRequest(
            "Push endpoint must be an https URL".to_string(),
        ));
    }
    if req.p256dh.trim().is_empty() || req.auth.trim().is_empty() {
        return Err(ServiceError::BadRequest(
            "Subscription keys p256dh and auth are required".to_string(),
        ));
    }
    Ok(())
}

/// Push one notification to the user's subscription. A subscription the
/// push service reports as gone is deleted.
async fn deliver(
    state: &SharedState,
    user: &User,
    notification: &Notification,
    failure: &str,
) -> Result<(), ServiceError> {
    let user_id = user.id;
    let subscription = state
        .db
        .call(move |db| db.get_push_subscription(user_id))
        .await?;
    let Some(subscription) = subscription else {
        tracing::info!(user = %user.email, tag = %notification.tag, "no push subscription");
        return Err(ServiceError::Internal(failure.to_string()));
    };
    match state.push.send(&subscription, notification).await {
        Ok(()) => {
            tracing::info!(user = %user.email, tag = %notification.tag, "notification sent");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(user = %user.email, tag = %notification.tag, error = %e, "notification failed");
            if e.is_gone() {
                state
                    .db
                    .call(move |db| db.delete_push_subscription(user_id))
                    .await?;
            }
            Err(ServiceError::Internal(failure.to_string()))
        }
    }
}

async fn subscribe(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<PushSubscriptionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_subscription(&req)?;
    let user_id = user.id;
    let subscription = state
        .db
        .call(move |db| db.upsert_push_subscription(user_id, &req.endpoint, &req.p256dh, &req.auth))
        .await?;
    tracing::info!(user = %user.email, "push subscription saved");
    Ok(Json(subscription))
}

async fn get_subscription(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    let subscription = state
        .db
        .call(move |db| db.get_push_subscription(user.id))
        .await?;
    Ok(Json(subscription))
}

async fn unsubscribe(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    let user_id = user.id;
    let deleted = state
        .db
        .call(move |db| db.delete_push_subscription(user_id))
        .await?;
    if !deleted {
        return Err(ServiceError::NotFound(
            "No push subscription found to delete".to_string(),
        ));
    }
    tracing::info!(user = %user.email, "push subscription removed");
    Ok(Json(serde_json::json!({
        "message": "Successfully unsubscribed from notifications"
    })))
}

async fn send_test(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    let notification = Notification::new(
        "Test Notification",
        "This is a test notification from LOS!",
        "test-notification",
    );
    deliver(&state, &user, &notification, "Failed to send test notification").await?;
    Ok(Json(serde_json::json!({
        "message": "Test notification sent successfully"
    })))
}

async fn send_test_reminder(
    state: &SharedState,
    user: &User,
    kind: ReminderKind,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let failure = format!("Failed to send test {} reminder", kind.as_str());
    deliver(state, user, &kind.test_notification(), &failure).await?;
    Ok(Json(serde_json::json!({
        "message": format!("Test {} reminder sent successfully", kind.as_str())
    })))
}

async fn test_morning_reminder(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    send_test_reminder(&state, &user, ReminderKind::Morning).await
}

async fn test_evening_reminder(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ServiceError> {
    send_test_reminder(&state, &user, ReminderKind::Evening).await
}
