//! Relational chat store for CareLink.
//!
//! Chats are conversations between participants (doctors, patients,
//! receptionists); messages are appended to a chat and read back newest
//! first. The realtime server persists every chat message here *before*
//! routing it, so this table doubles as the offline queue for recipients
//! that are not connected.
//!
//! System events (account activation and the like) are stored per
//! recipient in [`notifications`] for the same reason.
//!
//! All functions take a borrowed `rusqlite::Connection` and are blocking;
//! async callers run them inside `tokio::task::spawn_blocking`.

pub mod notifications;

use carelink_types::{Payload, PayloadKind, UnknownRole, UserIdentity, UserRole};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use notifications::{create_notification, list_notifications, NewNotification, StoredNotification};

/// Errors that can occur during chat store operations.
#[derive(Debug, Error)]
pub enum ChatStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("chat not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    InvalidRole(#[from] UnknownRole),
    #[error("payload kind {0} cannot be stored as a chat message")]
    UnsupportedPayload(&'static str),
}

/// A conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Membership of a user in a chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub chat_id: String,
    pub user_id: String,
    pub user_type: UserRole,
    pub joined_at: String,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    /// Internal database ID.
    pub id: i64,
    /// Public message ID.
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    /// `text` or `image`.
    pub kind: PayloadKind,
    /// Text body, or the caption of an image.
    pub content: Option<String>,
    /// Object-storage key of an image message.
    pub image_key: Option<String>,
    /// Creation timestamp (RFC 3339, millisecond precision, UTC).
    pub created_at: String,
}

/// Parameters for appending a message to a chat.
#[derive(Debug, Clone)]
pub struct CreateMessageParams {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// A one-to-one chat as listed for one of its two participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSummary {
    pub chat_id: String,
    pub updated_at: String,
    /// The other participant.
    pub recipient_user_id: String,
    pub recipient_user_type: UserRole,
    pub last_message_kind: Option<PayloadKind>,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
}

/// Formats a timestamp the way every table in this store stores it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Creates an empty chat.
pub fn create_chat(conn: &Connection, chat_id: &str) -> Result<Chat, ChatStoreError> {
    let chat = conn.query_row(
        "INSERT INTO chats (id) VALUES (?1) RETURNING id, created_at, updated_at",
        [chat_id],
        map_row_to_chat,
    )?;
    Ok(chat)
}

/// Retrieves a chat by ID.
pub fn get_chat(conn: &Connection, chat_id: &str) -> Result<Chat, ChatStoreError> {
    conn.query_row(
        "SELECT id, created_at, updated_at FROM chats WHERE id = ?1",
        [chat_id],
        map_row_to_chat,
    )
    .optional()?
    .ok_or_else(|| ChatStoreError::NotFound(chat_id.to_string()))
}

/// Adds a user to a chat. Adding an existing participant is a no-op.
pub fn add_participant(
    conn: &Connection,
    chat_id: &str,
    user_id: &str,
    role: UserRole,
) -> Result<(), ChatStoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO participants (chat_id, user_id, user_type) VALUES (?1, ?2, ?3)",
        params![chat_id, user_id, role.as_str()],
    )?;
    Ok(())
}

/// Checks whether a user participates in a chat.
pub fn is_participant(
    conn: &Connection,
    chat_id: &str,
    user_id: &str,
) -> Result<bool, ChatStoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM participants WHERE chat_id = ?1 AND user_id = ?2)",
        params![chat_id, user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Lists the participants of a chat in join order.
///
/// Returns `NotFound` when the chat itself does not exist, so callers can
/// tell "unknown conversation" apart from "conversation with nobody in it".
pub fn list_participants(
    conn: &Connection,
    chat_id: &str,
) -> Result<Vec<Participant>, ChatStoreError> {
    get_chat(conn, chat_id)?;

    let mut stmt = conn.prepare(
        "SELECT chat_id, user_id, user_type, joined_at
         FROM participants WHERE chat_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([chat_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut participants = Vec::new();
    for row in rows {
        let (chat_id, user_id, user_type, joined_at) = row?;
        participants.push(Participant {
            chat_id,
            user_id,
            user_type: user_type.parse()?,
            joined_at,
        });
    }
    Ok(participants)
}

/// Participant identities of a chat, for routing.
pub fn participant_identities(
    conn: &Connection,
    chat_id: &str,
) -> Result<Vec<UserIdentity>, ChatStoreError> {
    Ok(list_participants(conn, chat_id)?
        .into_iter()
        .map(|p| UserIdentity::from(p.user_id))
        .collect())
}

/// Returns the one-to-one chat between two users, creating it if needed.
///
/// Only chats with exactly these two participants qualify; a group chat
/// that happens to contain both users is not reused. The lookup and the
/// insert share one write transaction, so concurrent callers for the same
/// pair serialize on the database lock and end up with a single chat.
pub fn find_or_create_direct_chat(
    conn: &Connection,
    (user_a, role_a): (&str, UserRole),
    (user_b, role_b): (&str, UserRole),
) -> Result<Chat, ChatStoreError> {
    let tx = write_transaction(conn)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT p1.chat_id
             FROM participants p1
             JOIN participants p2 ON p2.chat_id = p1.chat_id
             WHERE p1.user_id = ?1 AND p2.user_id = ?2
               AND (SELECT COUNT(*) FROM participants p3 WHERE p3.chat_id = p1.chat_id) = 2
             LIMIT 1",
            params![user_a, user_b],
            |row| row.get(0),
        )
        .optional()?;

    let chat = match existing {
        Some(chat_id) => get_chat(&tx, &chat_id)?,
        None => {
            let chat = create_chat(&tx, &uuid::Uuid::new_v4().to_string())?;
            add_participant(&tx, &chat.id, user_a, role_a)?;
            add_participant(&tx, &chat.id, user_b, role_b)?;
            tracing::debug!(chat_id = %chat.id, user_a, user_b, "created direct chat");
            chat
        }
    };

    tx.commit()?;
    Ok(chat)
}

/// Lists the caller's one-to-one chats, most recently active first, with
/// the other participant and the latest message of each.
///
/// This is how a user coming back online finds the chats that changed
/// while they were away.
pub fn list_chats_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ChatSummary>, ChatStoreError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.updated_at, other.user_id, other.user_type,
                lm.kind, COALESCE(lm.content, lm.image_key), lm.created_at
         FROM chats c
         JOIN participants me ON me.chat_id = c.id AND me.user_id = ?1
         JOIN participants other ON other.chat_id = c.id AND other.user_id != ?1
         LEFT JOIN messages lm ON lm.id = (
             SELECT m.id FROM messages m
             WHERE m.chat_id = c.id
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT 1
         )
         WHERE (SELECT COUNT(*) FROM participants p WHERE p.chat_id = c.id) = 2
         ORDER BY c.updated_at DESC, c.id ASC",
    )?;
    let rows = stmt.query_map([user_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut chats = Vec::new();
    for row in rows {
        let (chat_id, updated_at, recipient_user_id, user_type, kind, last_message, last_at) = row?;
        chats.push(ChatSummary {
            chat_id,
            updated_at,
            recipient_user_id,
            recipient_user_type: user_type.parse()?,
            last_message_kind: kind.as_deref().map(parse_kind),
            last_message,
            last_message_at: last_at,
        });
    }
    Ok(chats)
}

/// Appends a message to a chat and bumps the chat's `updated_at`.
///
/// Returns `NotFound` when the chat does not exist.
pub fn create_message(
    conn: &Connection,
    params: &CreateMessageParams,
) -> Result<StoredMessage, ChatStoreError> {
    let (kind, content, image_key) = match &params.payload {
        Payload::Text { content } => (PayloadKind::Text, Some(content.as_str()), None),
        Payload::Image { key, caption } => {
            (PayloadKind::Image, caption.as_deref(), Some(key.as_str()))
        }
        Payload::SystemEvent { .. } => {
            return Err(ChatStoreError::UnsupportedPayload(
                PayloadKind::SystemEvent.as_str(),
            ))
        }
    };
    let created_at = format_timestamp(params.created_at);

    let tx = write_transaction(conn)?;
    get_chat(&tx, &params.chat_id)?;
    let message = tx.query_row(
        "INSERT INTO messages (message_id, chat_id, sender_id, kind, content, image_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id, message_id, chat_id, sender_id, kind, content, image_key, created_at",
        params![
            params.message_id,
            params.chat_id,
            params.sender_id,
            kind.as_str(),
            content,
            image_key,
            created_at,
        ],
        map_row_to_message,
    )?;
    tx.execute(
        "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
        params![params.chat_id, created_at],
    )?;
    tx.commit()?;

    Ok(message)
}

/// Lists messages of a chat, newest first.
///
/// `before` is an exclusive `created_at` upper bound for paging. `limit`
/// defaults to 50 and is capped at 100.
pub fn list_messages(
    conn: &Connection,
    chat_id: &str,
    before: Option<String>,
    limit: Option<u32>,
) -> Result<Vec<StoredMessage>, ChatStoreError> {
    let limit = limit.unwrap_or(50).min(100);

    let mut stmt = conn.prepare(
        "SELECT id, message_id, chat_id, sender_id, kind, content, image_key, created_at
         FROM messages
         WHERE chat_id = ?1 AND (?2 IS NULL OR created_at < ?2)
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![chat_id, before, limit], map_row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// `BEGIN IMMEDIATE`. Under WAL a deferred transaction that reads before
/// writing fails with `SQLITE_BUSY` instead of waiting on the busy timeout.
fn write_transaction(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

fn parse_kind(kind: &str) -> PayloadKind {
    match kind {
        "image" => PayloadKind::Image,
        _ => PayloadKind::Text,
    }
}

fn map_row_to_chat(row: &Row) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
    })
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
    let kind: String = row.get(4)?;
    let kind = parse_kind(&kind);
    Ok(StoredMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        chat_id: row.get(2)?,
        sender_id: row.get(3)?,
        kind,
        content: row.get(5)?,
        image_key: row.get(6)?,
        created_at: row.get(7)?,
    })
}
