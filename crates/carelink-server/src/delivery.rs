//! Delivery: persist first, then push to whoever is online.

use crate::connection::{Connection, InboundHandler};
use crate::protocol::{payload_from_parts, ClientFrame, ServerFrame};
use crate::router::MessageRouter;
use crate::store::{MessageStore, StorageError};
use async_trait::async_trait;
use axum::http::StatusCode;
use carelink_types::{
    ConversationRef, DeliveryOutcome, MessageId, OutboundMessage, Payload, UserIdentity,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Default upper bound on message text, in bytes.
pub const DEFAULT_MAX_CONTENT_LEN: usize = 65_536;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{sender} is not a participant of {conversation}")]
    NotParticipant {
        sender: UserIdentity,
        conversation: ConversationRef,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DeliveryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotParticipant { .. } => StatusCode::FORBIDDEN,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Storage(StorageError::ConversationNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Storage(StorageError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text safe to show to the client; backend details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Storage(StorageError::Backend(_)) => {
                "failed to send message: internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// What a send reports back to the sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub outcomes: BTreeMap<UserIdentity, DeliveryOutcome>,
}

/// Who may post into a conversation through [`ChatDeliveryService::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderPolicy {
    /// Only the conversation's participants.
    #[default]
    Participants,
    /// Any authenticated user; the conversation's participants receive it.
    Anyone,
}

impl std::str::FromStr for SenderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "participants" => Ok(Self::Participants),
            "anyone" => Ok(Self::Anyone),
            other => Err(format!("unknown sender policy: {}", other)),
        }
    }
}

/// Stores messages and routes them to their recipients.
pub struct ChatDeliveryService {
    store: Arc<dyn MessageStore>,
    router: MessageRouter,
    max_content_len: usize,
    sender_policy: SenderPolicy,
}

impl ChatDeliveryService {
    pub fn new(store: Arc<dyn MessageStore>, router: MessageRouter, max_content_len: usize) -> Self {
        Self {
            store,
            router,
            max_content_len,
            sender_policy: SenderPolicy::default(),
        }
    }

    pub fn with_sender_policy(mut self, policy: SenderPolicy) -> Self {
        self.sender_policy = policy;
        self
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Sends a message written by a client, over the API or a socket.
    ///
    /// Applies the sender policy, then [`send_message`](Self::send_message).
    pub async fn submit(
        &self,
        sender: &UserIdentity,
        conversation: &ConversationRef,
        payload: Payload,
    ) -> Result<SendReceipt, DeliveryError> {
        self.validate(&payload)?;

        if self.sender_policy == SenderPolicy::Participants {
            let participants = self.store.resolve_participants(conversation).await?;
            if !participants.contains(sender) {
                return Err(DeliveryError::NotParticipant {
                    sender: sender.clone(),
                    conversation: conversation.clone(),
                });
            }
        }

        self.send_message(sender, conversation, payload).await
    }

    /// Stores a message from `sender`, then routes it to every participant
    /// of `conversation` except the sender.
    ///
    /// Nothing is routed unless the save succeeded. Recipients that are
    /// offline are reported as `QueuedOffline` and never fail the call.
    pub async fn send_message(
        &self,
        sender: &UserIdentity,
        conversation: &ConversationRef,
        payload: Payload,
    ) -> Result<SendReceipt, DeliveryError> {
        self.validate(&payload)?;

        let created_at = Utc::now();
        let message_id = self
            .store
            .save_message(conversation, sender, &payload, created_at)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    sender = %sender,
                    chat_id = %conversation,
                    "failed to persist message: {}",
                    e
                )
            })?;

        let participants = self
            .store
            .resolve_participants(conversation)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    sender = %sender,
                    chat_id = %conversation,
                    message_id = %message_id,
                    "message stored but participants unavailable: {}",
                    e
                )
            })?;

        let recipients: Vec<UserIdentity> = participants
            .into_iter()
            .filter(|participant| participant != sender)
            .collect();
        let message = OutboundMessage::chat(
            message_id.clone(),
            conversation.clone(),
            sender.clone(),
            recipients,
            payload,
            created_at,
        );
        let outcomes = self.router.route(&message);

        tracing::debug!(
            sender = %sender,
            chat_id = %conversation,
            message_id = %message_id,
            recipients = outcomes.len(),
            "message delivered"
        );

        Ok(SendReceipt {
            message_id,
            outcomes,
        })
    }

    /// Stores a system event for each recipient, then pushes it to the ones
    /// that are online.
    pub async fn notify(
        &self,
        sender: &UserIdentity,
        recipients: Vec<UserIdentity>,
        event: &str,
        data: serde_json::Value,
    ) -> Result<SendReceipt, DeliveryError> {
        if event.trim().is_empty() {
            return Err(DeliveryError::InvalidPayload(
                "event name must not be empty".to_string(),
            ));
        }
        if recipients.is_empty() {
            return Err(DeliveryError::InvalidPayload(
                "at least one recipient is required".to_string(),
            ));
        }

        let created_at = Utc::now();
        let notification_id = self
            .store
            .save_event(sender, &recipients, event, &data, created_at)
            .await
            .inspect_err(|e| {
                tracing::error!(sender = %sender, event, "failed to persist event: {}", e)
            })?;

        let message = OutboundMessage::system_event(
            notification_id.clone(),
            sender.clone(),
            recipients,
            event,
            data,
            created_at,
        );
        let outcomes = self.router.route(&message);
        tracing::debug!(sender = %sender, event, recipients = outcomes.len(), "event routed");

        Ok(SendReceipt {
            message_id: notification_id,
            outcomes,
        })
    }

    fn validate(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let content = match payload {
            Payload::Text { content } => {
                if content.trim().is_empty() {
                    return Err(DeliveryError::InvalidPayload(
                        "message content must not be empty".to_string(),
                    ));
                }
                Some(content)
            }
            Payload::Image { key, caption } => {
                if key.trim().is_empty() {
                    return Err(DeliveryError::InvalidPayload(
                        "image key must not be empty".to_string(),
                    ));
                }
                caption.as_ref()
            }
            Payload::SystemEvent { .. } => {
                return Err(DeliveryError::InvalidPayload(
                    "system events cannot be sent as chat messages".to_string(),
                ));
            }
        };

        if content.is_some_and(|c| c.len() > self.max_content_len) {
            return Err(DeliveryError::InvalidPayload(format!(
                "message content exceeds maximum length of {} bytes",
                self.max_content_len
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for ChatDeliveryService {
    async fn on_frame(&self, conn: &Arc<Connection>, frame: ClientFrame) {
        match frame {
            ClientFrame::Ping => conn.reply(&ServerFrame::Pong),
            ClientFrame::Message {
                chat_id,
                content,
                key,
            } => {
                let Some(payload) = payload_from_parts(content, key) else {
                    conn.reply(&ServerFrame::error("message needs content or key"));
                    return;
                };
                let conversation = ConversationRef::new(chat_id);

                match self.submit(conn.identity(), &conversation, payload).await {
                    Ok(receipt) => conn.reply(&ServerFrame::MessageSent {
                        message_id: receipt.message_id,
                        chat_id: conversation.to_string(),
                        outcomes: receipt.outcomes,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            identity = %conn.identity(),
                            chat_id = %conversation,
                            "socket message rejected: {}",
                            e
                        );
                        conn.reply(&ServerFrame::error(e.client_message()));
                    }
                }
            }
        }
    }
}
