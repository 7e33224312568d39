//! Presence API: who is connected right now.

use crate::AppState;
use axum::{
    extract::{Extension, Path},
    Json,
};
use carelink_types::UserIdentity;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: UserIdentity,
    pub online: bool,
    pub connections: usize,
}

/// `GET /api/v1/presence/{userId}`: live connection count for a user.
pub async fn get_presence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let user_id = UserIdentity::from(user_id);
    let connections = state.registry.connections_for(&user_id).len();
    Json(PresenceResponse {
        user_id,
        online: connections > 0,
        connections,
    })
}
