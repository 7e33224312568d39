//! JSON frames exchanged over the realtime socket.

use carelink_chat::format_timestamp;
use carelink_types::{
    DeliveryOutcome, MessageId, OutboundMessage, Payload, PayloadKind, UserIdentity,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keep-alive; answered with [`ServerFrame::Pong`].
    Ping,
    /// A chat message. `key` marks an image reference, in which case
    /// `content` is its caption.
    Message {
        #[serde(alias = "chatId")]
        chat_id: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        key: Option<String>,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage {
        message_id: String,
        chat_id: String,
        sender_id: UserIdentity,
        recipient_id: UserIdentity,
        kind: PayloadKind,
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        created_at: String,
    },
    Notification {
        notification_id: String,
        event: String,
        sender_id: UserIdentity,
        recipient_id: UserIdentity,
        data: serde_json::Value,
        created_at: String,
    },
    /// Acknowledges a `message` frame to the connection that sent it.
    MessageSent {
        message_id: MessageId,
        chat_id: String,
        outcomes: BTreeMap<UserIdentity, DeliveryOutcome>,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerFrame {
    /// Renders a routed message as seen by one recipient.
    pub fn for_recipient(message: &OutboundMessage, recipient: &UserIdentity) -> Self {
        let created_at = format_timestamp(message.created_at());
        let (kind, content, key) = match message.payload() {
            Payload::SystemEvent { event, data } => {
                return Self::Notification {
                    notification_id: message.message_id().to_string(),
                    event: event.clone(),
                    sender_id: message.sender().clone(),
                    recipient_id: recipient.clone(),
                    data: data.clone(),
                    created_at,
                };
            }
            Payload::Text { content } => (PayloadKind::Text, Some(content.clone()), None),
            Payload::Image { key, caption } => {
                (PayloadKind::Image, caption.clone(), Some(key.clone()))
            }
        };

        Self::NewMessage {
            message_id: message.message_id().to_string(),
            chat_id: message
                .conversation()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            sender_id: message.sender().clone(),
            recipient_id: recipient.clone(),
            kind,
            content,
            key,
            created_at,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds a chat payload from the loose `content`/`key` pair used by both
/// the socket and the REST API. Returns `None` when neither is present.
pub fn payload_from_parts(content: Option<String>, key: Option<String>) -> Option<Payload> {
    match (key.filter(|k| !k.is_empty()), content) {
        (Some(key), caption) => Some(Payload::Image {
            key,
            caption: caption.filter(|c| !c.is_empty()),
        }),
        (None, Some(content)) => Some(Payload::Text { content }),
        (None, None) => None,
    }
}
