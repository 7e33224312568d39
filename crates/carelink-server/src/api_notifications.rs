//! Out-of-band notifications (account activation, registration notices).

use crate::middleware::IdentityContext;
use crate::AppState;
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use carelink_chat::{list_notifications, StoredNotification};
use carelink_types::{DeliveryOutcome, MessageId, UserIdentity, UserRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on recipients of a single notification.
const MAX_NOTIFICATION_RECIPIENTS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub recipients: Vec<UserIdentity>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub notification_id: MessageId,
    pub outcomes: BTreeMap<UserIdentity, DeliveryOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationListParams {
    pub before: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<StoredNotification>,
}

/// `POST /api/v1/notifications`: stores a system event for each recipient
/// and pushes it to the ones that are online.
///
/// Recipients reported as `queued_offline` read the event back from
/// `GET /api/v1/notifications`. Only staff (doctors and receptionists) may
/// send notifications.
pub async fn notify_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Json(body): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, StatusCode> {
    if user.role == UserRole::Patient {
        return Err(StatusCode::FORBIDDEN);
    }
    if body.recipients.len() > MAX_NOTIFICATION_RECIPIENTS {
        return Err(StatusCode::BAD_REQUEST);
    }

    let receipt = state
        .delivery
        .notify(&user.identity, body.recipients, &body.event, body.data)
        .await
        .map_err(|e| {
            tracing::debug!(identity = %user.identity, "notification rejected: {}", e);
            e.status_code()
        })?;

    Ok(Json(NotifyResponse {
        notification_id: receipt.message_id,
        outcomes: receipt.outcomes,
    }))
}

/// `GET /api/v1/notifications`: the caller's stored notifications, newest
/// first.
pub async fn list_notifications_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Query(params): Query<NotificationListParams>,
) -> Result<Json<NotificationListResponse>, StatusCode> {
    let pool = state.pool.clone();
    let recipient_id = user.identity.to_string();

    let notifications = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!("failed to get db connection: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        list_notifications(&conn, &recipient_id, params.before, params.limit).map_err(|e| {
            tracing::error!(recipient_id = %recipient_id, "failed to list notifications: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(NotificationListResponse { notifications }))
}
