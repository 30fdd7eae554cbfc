//! Notification queue. Rows are enqueued once and delivered at most once;
//! the atomic claim in [`NotificationStore::claim_delivered`] makes repeat
//! delivery attempts harmless.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use valet_core::{Notification, Result, ValetError};

use crate::db::{ValetDb, parse_ts, parse_ts_opt, ts, ts_opt};

const COLUMNS: &str = "id, user_id, message, source_bot_id, metadata,
                       scheduled_for, delivered_at, read_at, created_at";

#[derive(Clone)]
pub struct NotificationStore {
    db: ValetDb,
}

impl NotificationStore {
    pub fn new(db: ValetDb) -> Self {
        Self { db }
    }

    /// Enqueue a notification. `scheduled_for` of None means it is due now.
    /// Returns the stored row with its assigned id.
    pub fn insert(
        &self,
        user_id: &str,
        message: &str,
        source_bot_id: &str,
        metadata: serde_json::Value,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<Notification> {
        let created_at = Utc::now();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO notifications
             (user_id, message, source_bot_id, metadata, scheduled_for, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                message,
                source_bot_id,
                metadata.to_string(),
                ts_opt(scheduled_for),
                ts(created_at),
            ],
        )
        .map_err(ValetError::storage)?;
        Ok(Notification {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            source_bot_id: source_bot_id.to_string(),
            metadata,
            scheduled_for,
            delivered_at: None,
            read_at: None,
            created_at,
        })
    }

    pub fn get(&self, id: i64) -> Result<Notification> {
        self.db
            .conn()?
            .query_row(
                &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
                [id],
                row_to_notification,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ValetError::not_found("notification", id.to_string())
                }
                other => ValetError::storage(other),
            })
    }

    /// Atomically claim a notification for delivery. Returns true only for
    /// the first caller; later attempts (duplicate timer firings, manual
    /// re-delivery) see false and must not re-send.
    pub fn claim_delivered(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let n = self
            .db
            .conn()?
            .execute(
                "UPDATE notifications SET delivered_at = ?2
                 WHERE id = ?1 AND delivered_at IS NULL",
                params![id, ts(at)],
            )
            .map_err(ValetError::storage)?;
        Ok(n > 0)
    }

    /// Undelivered notifications for a user that are already due, oldest
    /// first. Deferred rows whose `scheduled_for` is still in the future are
    /// excluded; their delivery task will handle them.
    pub fn pending_for_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM notifications
                 WHERE user_id = ?1 AND delivered_at IS NULL
                   AND (scheduled_for IS NULL OR scheduled_for <= ?2)
                 ORDER BY created_at, id"
            ),
            params![user_id, ts(now)],
        )
    }

    /// Notification history for a user, newest first. With `include_read`
    /// false, rows that were already read are filtered out.
    pub fn list_for_user(
        &self,
        user_id: &str,
        include_read: bool,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        let filter = if include_read {
            ""
        } else {
            "AND read_at IS NULL"
        };
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM notifications
                 WHERE user_id = ?1 {filter}
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ),
            params![user_id, limit],
        )
    }

    /// Mark a delivered notification as read. Returns true if it existed
    /// and was unread.
    pub fn mark_read(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let n = self
            .db
            .conn()?
            .execute(
                "UPDATE notifications SET read_at = ?2
                 WHERE id = ?1 AND read_at IS NULL",
                params![id, ts(at)],
            )
            .map_err(ValetError::storage)?;
        Ok(n > 0)
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Notification>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(sql).map_err(ValetError::storage)?;
        let rows = stmt
            .query_map(args, row_to_notification)
            .map_err(ValetError::storage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(ValetError::storage)?);
        }
        Ok(out)
    }
}

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let metadata: String = row.get(4)?;
    let scheduled_for: Option<String> = row.get(5)?;
    let delivered_at: Option<String> = row.get(6)?;
    let read_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message: row.get(2)?,
        source_bot_id: row.get(3)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        scheduled_for: parse_ts_opt(scheduled_for).unwrap_or(None),
        delivered_at: parse_ts_opt(delivered_at).unwrap_or(None),
        read_at: parse_ts_opt(read_at).unwrap_or(None),
        created_at: parse_ts(&created_at).unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> NotificationStore {
        NotificationStore::new(ValetDb::open_in_memory().unwrap())
    }

    #[test]
    fn claim_succeeds_exactly_once() {
        let store = store();
        let n = store
            .insert("u1", "water the plants", "reminder", json!({}), None)
            .unwrap();
        assert!(store.claim_delivered(n.id, Utc::now()).unwrap());
        assert!(!store.claim_delivered(n.id, Utc::now()).unwrap());
        assert!(store.get(n.id).unwrap().delivered_at.is_some());
    }

    #[test]
    fn pending_excludes_delivered() {
        let store = store();
        let a = store.insert("u1", "first", "reminder", json!({}), None).unwrap();
        store.insert("u1", "second", "reminder", json!({}), None).unwrap();
        store.insert("u2", "other user", "reminder", json!({}), None).unwrap();

        store.claim_delivered(a.id, Utc::now()).unwrap();
        let pending = store.pending_for_user("u1", Utc::now()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "second");
    }

    #[test]
    fn pending_skips_not_yet_due_deferred() {
        let store = store();
        let now = Utc::now();
        store
            .insert("u1", "due now", "reminder", json!({}), None)
            .unwrap();
        store
            .insert("u1", "tomorrow", "reminder", json!({}), Some(now + chrono::Duration::days(1)))
            .unwrap();
        let pending = store.pending_for_user("u1", now).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "due now");
    }

    #[test]
    fn listing_is_newest_first_and_respects_read_filter() {
        let store = store();
        for i in 0..5 {
            store
                .insert("u1", &format!("msg {i}"), "proactive", json!({}), None)
                .unwrap();
        }
        let history = store.list_for_user("u1", true, 3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "msg 4");

        store.mark_read(history[0].id, Utc::now()).unwrap();
        let unread = store.list_for_user("u1", false, 10).unwrap();
        assert_eq!(unread.len(), 4);
        assert!(unread.iter().all(|n| n.read_at.is_none()));
    }

    #[test]
    fn mark_read_is_idempotent() {
        let store = store();
        let n = store.insert("u1", "hello", "chat", json!({}), None).unwrap();
        assert!(store.mark_read(n.id, Utc::now()).unwrap());
        assert!(!store.mark_read(n.id, Utc::now()).unwrap());
        assert!(!store.mark_read(999, Utc::now()).unwrap());
    }

    #[test]
    fn deferred_keeps_scheduled_for() {
        let store = store();
        let later = Utc::now() + chrono::Duration::minutes(30);
        let n = store
            .insert("u1", "later", "reminder", json!({"kind": "deferred"}), Some(later))
            .unwrap();
        let loaded = store.get(n.id).unwrap();
        assert_eq!(
            loaded.scheduled_for.map(|t| t.timestamp_micros()),
            Some(later.timestamp_micros())
        );
        assert_eq!(loaded.metadata, json!({"kind": "deferred"}));
    }
}
