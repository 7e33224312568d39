//! Chat REST API.

use crate::delivery::{DeliveryError, SendReceipt};
use crate::middleware::IdentityContext;
use crate::protocol::payload_from_parts;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use carelink_chat::{
    find_or_create_direct_chat, is_participant, list_chats_for_user, list_messages, Chat,
    ChatStoreError, ChatSummary, StoredMessage,
};
use carelink_types::{ConversationRef, UserRole};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(alias = "chatId")]
    pub chat_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub before: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize)]
pub struct ChatListResponse {
    pub chats: Vec<ChatSummary>,
}

#[derive(Debug, Deserialize)]
pub struct FindOrCreateChatRequest {
    #[serde(alias = "selectedUserId")]
    pub selected_user_id: String,
    #[serde(alias = "selectedUserType")]
    pub selected_user_type: UserRole,
}

/// `POST /api/v1/chat/send-message`: stores a message and pushes it to
/// the other participants that are online.
///
/// Offline recipients show up as `queued_offline` in the receipt; they
/// never make the request fail. Whether the caller must be a participant
/// is decided by `realtime.sender_policy`.
pub async fn send_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<SendReceipt>, StatusCode> {
    let payload =
        payload_from_parts(body.content, body.key).ok_or(StatusCode::BAD_REQUEST)?;
    let conversation = ConversationRef::new(body.chat_id);

    state
        .delivery
        .submit(&user.identity, &conversation, payload)
        .await
        .map(Json)
        .map_err(|e: DeliveryError| {
            tracing::debug!(
                identity = %user.identity,
                chat_id = %conversation,
                "send-message rejected: {}",
                e
            );
            e.status_code()
        })
}

/// `GET /api/v1/chat/{chatId}/messages`: message history, newest first.
///
/// This is also how a recipient that was offline picks up what it missed.
pub async fn get_messages_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Path(chat_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = user.identity.to_string();

    let messages = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!("failed to get db connection: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        match is_participant(&conn, &chat_id, &user_id) {
            Ok(true) => {}
            Ok(false) => return Err(StatusCode::FORBIDDEN),
            Err(e) => {
                tracing::error!(chat_id = %chat_id, "participant check failed: {}", e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        list_messages(&conn, &chat_id, params.before, params.limit).map_err(|e| {
            tracing::error!(chat_id = %chat_id, "failed to list messages: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(HistoryResponse { messages }))
}

/// `GET /api/v1/chat/chats`: the caller's one-to-one chats, most recently
/// active first, each with the other participant and the latest message.
pub async fn list_chats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
) -> Result<Json<ChatListResponse>, StatusCode> {
    let pool = state.pool.clone();
    let user_id = user.identity.to_string();

    let chats = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!("failed to get db connection: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        list_chats_for_user(&conn, &user_id).map_err(|e| {
            tracing::error!(user_id = %user_id, "failed to list chats: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(ChatListResponse { chats }))
}

/// `POST /api/v1/chat/find-or-create`: the one-to-one chat between the
/// caller and the selected user.
pub async fn find_or_create_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(IdentityContext(user)): Extension<IdentityContext>,
    Json(body): Json<FindOrCreateChatRequest>,
) -> Result<Json<Chat>, StatusCode> {
    if body.selected_user_id.is_empty() || body.selected_user_id == user.identity.as_str() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let pool = state.pool.clone();
    let chat = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!("failed to get db connection: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        find_or_create_direct_chat(
            &conn,
            (user.identity.as_str(), user.role),
            (body.selected_user_id.as_str(), body.selected_user_type),
        )
        .map_err(|e: ChatStoreError| {
            tracing::error!("failed to find or create chat: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(chat))
}
