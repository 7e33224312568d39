//! Durable message storage used by the delivery service.

use async_trait::async_trait;
use carelink_chat::{
    create_message, create_notification, participant_identities, ChatStoreError,
    CreateMessageParams, NewNotification,
};
use carelink_db::DbPool;
use carelink_types::{ConversationRef, MessageId, Payload, UserIdentity};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure to read or write durable chat state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("storage failure: {0}")]
    Backend(String),
}

impl From<ChatStoreError> for StorageError {
    fn from(e: ChatStoreError) -> Self {
        match e {
            ChatStoreError::NotFound(id) => Self::ConversationNotFound(id),
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Where messages live before they are routed.
///
/// A successful save is what makes a message durable; recipients that are
/// offline read it back from here later.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fails with `ConversationNotFound` for an unknown conversation.
    async fn save_message(
        &self,
        conversation: &ConversationRef,
        sender: &UserIdentity,
        payload: &Payload,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId, StorageError>;

    /// Stores a system event once per recipient.
    async fn save_event(
        &self,
        sender: &UserIdentity,
        recipients: &[UserIdentity],
        event: &str,
        data: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId, StorageError>;

    async fn resolve_participants(
        &self,
        conversation: &ConversationRef,
    ) -> Result<Vec<UserIdentity>, StorageError>;
}

/// [`MessageStore`] backed by the SQLite chat tables.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: DbPool,
}

impl SqliteMessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save_message(
        &self,
        conversation: &ConversationRef,
        sender: &UserIdentity,
        payload: &Payload,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId, StorageError> {
        let pool = self.pool.clone();
        let params = CreateMessageParams {
            message_id: MessageId::generate().to_string(),
            chat_id: conversation.to_string(),
            sender_id: sender.to_string(),
            payload: payload.clone(),
            created_at,
        };

        let stored = tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::Backend(format!("pool error: {}", e)))?;
            create_message(&conn, &params).map_err(StorageError::from)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))??;

        Ok(MessageId::new(stored.message_id))
    }

    async fn save_event(
        &self,
        sender: &UserIdentity,
        recipients: &[UserIdentity],
        event: &str,
        data: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId, StorageError> {
        let pool = self.pool.clone();
        let id = MessageId::generate();
        let notification = NewNotification {
            notification_id: id.to_string(),
            sender_id: sender.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            event: event.to_string(),
            data: data.clone(),
            created_at,
        };

        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::Backend(format!("pool error: {}", e)))?;
            create_notification(&conn, &notification).map_err(StorageError::from)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))??;

        Ok(id)
    }

    async fn resolve_participants(
        &self,
        conversation: &ConversationRef,
    ) -> Result<Vec<UserIdentity>, StorageError> {
        let pool = self.pool.clone();
        let chat_id = conversation.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StorageError::Backend(format!("pool error: {}", e)))?;
            participant_identities(&conn, &chat_id).map_err(StorageError::from)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))?
    }
}
