//! Stored system events.
//!
//! A notification is written once per recipient before it is pushed, so a
//! recipient that was offline reads it back with [`list_notifications`].

use crate::{format_timestamp, write_transaction, ChatStoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// Parameters for storing one system event.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub notification_id: String,
    pub sender_id: String,
    pub recipients: Vec<String>,
    pub event: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A system event as stored for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredNotification {
    pub notification_id: String,
    pub recipient_id: String,
    pub sender_id: String,
    pub event: String,
    pub data: serde_json::Value,
    pub created_at: String,
}

/// Stores `notification` for every recipient in one transaction.
///
/// Repeated recipients are stored once.
pub fn create_notification(
    conn: &Connection,
    notification: &NewNotification,
) -> Result<(), ChatStoreError> {
    let created_at = format_timestamp(notification.created_at);
    let data = notification.data.to_string();

    let tx = write_transaction(conn)?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO notifications
                 (notification_id, recipient_id, sender_id, event, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for recipient in &notification.recipients {
            stmt.execute(params![
                notification.notification_id,
                recipient,
                notification.sender_id,
                notification.event,
                data,
                created_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Lists a user's notifications, newest first.
///
/// Same paging rules as [`crate::list_messages`]: `before` is an exclusive
/// `created_at` bound, `limit` defaults to 50 and is capped at 100.
pub fn list_notifications(
    conn: &Connection,
    recipient_id: &str,
    before: Option<String>,
    limit: Option<u32>,
) -> Result<Vec<StoredNotification>, ChatStoreError> {
    let limit = limit.unwrap_or(50).min(100);

    let mut stmt = conn.prepare(
        "SELECT notification_id, recipient_id, sender_id, event, data, created_at
         FROM notifications
         WHERE recipient_id = ?1 AND (?2 IS NULL OR created_at < ?2)
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![recipient_id, before, limit], map_row)?;

    let mut notifications = Vec::new();
    for row in rows {
        notifications.push(row?);
    }
    Ok(notifications)
}

fn map_row(row: &Row) -> rusqlite::Result<StoredNotification> {
    let data: String = row.get(4)?;
    Ok(StoredNotification {
        notification_id: row.get(0)?,
        recipient_id: row.get(1)?,
        sender_id: row.get(2)?,
        event: row.get(3)?,
        // Written by `create_notification` from a `serde_json::Value`.
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        carelink_db::run_migrations(&conn).expect("migrations should succeed");
        conn
    }

    fn activation(id: &str, recipients: &[&str], secs: i64) -> NewNotification {
        NewNotification {
            notification_id: id.to_string(),
            sender_id: "rec-1".to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            event: "account_activated".to_string(),
            data: json!({ "account": "doc-42" }),
            created_at: Utc
                .timestamp_opt(1_700_000_000 + secs, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[test]
    fn each_recipient_gets_its_own_copy() {
        let conn = test_db();
        create_notification(&conn, &activation("n-1", &["doc-42", "pat-9", "doc-42"], 0))
            .expect("insert should succeed");

        let doc = list_notifications(&conn, "doc-42", None, None).unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc[0].notification_id, "n-1");
        assert_eq!(doc[0].sender_id, "rec-1");
        assert_eq!(doc[0].data["account"], "doc-42");

        let pat = list_notifications(&conn, "pat-9", None, None).unwrap();
        assert_eq!(pat.len(), 1);
        assert!(list_notifications(&conn, "rec-1", None, None).unwrap().is_empty());
    }

    #[test]
    fn notifications_list_newest_first_and_page_with_before() {
        let conn = test_db();
        create_notification(&conn, &activation("n-1", &["doc-42"], 1)).unwrap();
        create_notification(&conn, &activation("n-2", &["doc-42"], 2)).unwrap();
        create_notification(&conn, &activation("n-3", &["doc-42"], 3)).unwrap();

        let all = list_notifications(&conn, "doc-42", None, None).unwrap();
        let ids: Vec<&str> = all.iter().map(|n| n.notification_id.as_str()).collect();
        assert_eq!(ids, vec!["n-3", "n-2", "n-1"]);

        let older = list_notifications(&conn, "doc-42", Some(all[1].created_at.clone()), Some(10))
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].notification_id, "n-1");
    }
}
