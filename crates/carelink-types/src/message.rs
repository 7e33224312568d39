//! Message shapes handed to the router and the outcomes it reports.

use crate::{ConversationRef, MessageId, UserIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of payload carried by an [`OutboundMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Image,
    SystemEvent,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::SystemEvent => "system_event",
        }
    }
}

/// Message body.
///
/// Images are routed by reference: `key` points into object storage and
/// is resolved by the client, never inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text {
        content: String,
    },
    Image {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    SystemEvent {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text { .. } => PayloadKind::Text,
            Self::Image { .. } => PayloadKind::Image,
            Self::SystemEvent { .. } => PayloadKind::SystemEvent,
        }
    }
}

/// A message ready for routing. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    message_id: MessageId,
    conversation: Option<ConversationRef>,
    sender: UserIdentity,
    recipients: Vec<UserIdentity>,
    payload: Payload,
    created_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Builds a chat message that has already been stored as `message_id`.
    pub fn chat(
        message_id: MessageId,
        conversation: ConversationRef,
        sender: UserIdentity,
        recipients: Vec<UserIdentity>,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            conversation: Some(conversation),
            sender,
            recipients: dedup(recipients),
            payload,
            created_at,
        }
    }

    /// Builds an out-of-band system event that has already been stored
    /// for each recipient as `message_id`.
    pub fn system_event(
        message_id: MessageId,
        sender: UserIdentity,
        recipients: Vec<UserIdentity>,
        event: impl Into<String>,
        data: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            conversation: None,
            sender,
            recipients: dedup(recipients),
            payload: Payload::SystemEvent {
                event: event.into(),
                data,
            },
            created_at,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn conversation(&self) -> Option<&ConversationRef> {
        self.conversation.as_ref()
    }

    pub fn sender(&self) -> &UserIdentity {
        &self.sender
    }

    pub fn recipients(&self) -> &[UserIdentity] {
        &self.recipients
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Keeps first occurrence order while dropping repeated recipients.
fn dedup(recipients: Vec<UserIdentity>) -> Vec<UserIdentity> {
    let mut seen = std::collections::HashSet::with_capacity(recipients.len());
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

/// Per-recipient result of a routing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// At least one live connection accepted the message.
    Delivered { connections: usize },
    /// The recipient had no live connection. Only reported for messages
    /// that were stored first, so the recipient reads it back later.
    QueuedOffline,
    /// Every live connection of the recipient had a full outbound queue.
    DropFullQueue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_status_tag() {
        let delivered = serde_json::to_value(DeliveryOutcome::Delivered { connections: 2 }).unwrap();
        assert_eq!(delivered, serde_json::json!({"status": "delivered", "connections": 2}));

        let offline = serde_json::to_value(DeliveryOutcome::QueuedOffline).unwrap();
        assert_eq!(offline, serde_json::json!({"status": "queued_offline"}));

        let dropped = serde_json::to_value(DeliveryOutcome::DropFullQueue).unwrap();
        assert_eq!(dropped, serde_json::json!({"status": "drop_full_queue"}));
    }

    #[test]
    fn repeated_recipients_are_collapsed() {
        let msg = OutboundMessage::system_event(
            MessageId::new("n-1"),
            "svc".into(),
            vec!["a".into(), "b".into(), "a".into()],
            "account_activated",
            serde_json::Value::Null,
            Utc::now(),
        );
        let expected: Vec<UserIdentity> = vec!["a".into(), "b".into()];
        assert_eq!(msg.recipients(), expected.as_slice());
        assert_eq!(msg.payload_kind(), PayloadKind::SystemEvent);
        assert_eq!(msg.message_id().as_str(), "n-1");
    }

    #[test]
    fn image_payload_omits_missing_caption() {
        let payload = Payload::Image {
            key: "images/1_scan.png".to_string(),
            caption: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "image", "key": "images/1_scan.png"}));
    }
}
