//! Branching conversation store.
//!
//! Assistant replies sharing one `parent_id` form a version group: versions
//! are dense from 1 and exactly one is active. Version swaps, rewinds, and
//! delete-cascades each run inside a single transaction, so readers never
//! observe a group with zero or two active versions.

use chrono::Utc;
use rusqlite::{Row, Transaction, params};
use valet_core::{Conversation, Result, Role, StoredMessage, ValetError};

use crate::db::{ValetDb, parse_ts, ts};

const MSG_COLUMNS: &str = "id, conversation_id, user_id, role, content, parent_id,
                           version, is_active_version, is_edited, metadata, timestamp";

#[derive(Clone)]
pub struct MessageStore {
    db: ValetDb,
}

impl MessageStore {
    pub fn new(db: ValetDb) -> Self {
        Self { db }
    }

    // ─── Conversations ──────────────────────────────────────

    pub fn create_conversation(&self, user_id: &str, title: Option<&str>) -> Result<Conversation> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .conn()?
            .execute(
                "INSERT INTO conversations (conversation_id, user_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![id, user_id, title, ts(now)],
            )
            .map_err(ValetError::storage)?;
        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.db
            .conn()?
            .query_row(
                "SELECT conversation_id, user_id, title, created_at, updated_at
                 FROM conversations WHERE conversation_id = ?1",
                [id],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ValetError::not_found("conversation", id),
                other => ValetError::storage(other),
            })
    }

    /// A user's conversations, most recently touched first.
    pub fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, user_id, title, created_at, updated_at
                 FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC",
            )
            .map_err(ValetError::storage)?;
        let rows = stmt
            .query_map([user_id], row_to_conversation)
            .map_err(ValetError::storage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(ValetError::storage)?);
        }
        Ok(out)
    }

    /// Delete a conversation; the foreign-key cascade takes its messages
    /// with it.
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let changed = self
            .db
            .conn()?
            .execute("DELETE FROM conversations WHERE conversation_id = ?1", [id])
            .map_err(ValetError::storage)?;
        if changed == 0 {
            return Err(ValetError::not_found("conversation", id));
        }
        Ok(())
    }

    /// Delete every conversation a user owns. Returns how many were removed.
    pub fn clear_for_user(&self, user_id: &str) -> Result<usize> {
        self.db
            .conn()?
            .execute("DELETE FROM conversations WHERE user_id = ?1", [user_id])
            .map_err(ValetError::storage)
    }

    // ─── Messages ──────────────────────────────────────

    /// Append a message. The first assistant reply to a parent becomes the
    /// active version 1; later appends to the same parent join the group as
    /// inactive versions numbered max + 1.
    pub fn append(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
        parent_id: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(ValetError::storage)?;
        // Fails early with NotFound for an unknown conversation
        bump_conversation(&tx, conversation_id)?;

        let (version, active) = match (role, parent_id) {
            (Role::Assistant, Some(parent)) => {
                let max: Option<i64> = tx
                    .query_row(
                        "SELECT MAX(version) FROM messages
                         WHERE conversation_id = ?1 AND parent_id = ?2",
                        params![conversation_id, parent],
                        |row| row.get(0),
                    )
                    .map_err(ValetError::storage)?;
                match max {
                    None => (1, true),
                    Some(max) => (max + 1, false),
                }
            }
            _ => (1, true),
        };

        tx.execute(
            "INSERT INTO messages
             (conversation_id, user_id, role, content, parent_id, version,
              is_active_version, is_edited, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            params![
                conversation_id,
                user_id,
                role.as_str(),
                content,
                parent_id,
                version,
                active as i32,
                metadata.as_ref().map(|m| m.to_string()),
                ts(now),
            ],
        )
        .map_err(ValetError::storage)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(ValetError::storage)?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            parent_id,
            version,
            is_active_version: active,
            is_edited: false,
            metadata,
            timestamp: now,
        })
    }

    /// Replace a message's content in place. Version and active state are
    /// untouched.
    pub fn edit(&self, message_id: i64, new_content: &str) -> Result<StoredMessage> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(ValetError::storage)?;
        let n = tx
            .execute(
                "UPDATE messages SET content = ?2, is_edited = 1 WHERE id = ?1",
                params![message_id, new_content],
            )
            .map_err(ValetError::storage)?;
        if n == 0 {
            return Err(ValetError::not_found("message", message_id.to_string()));
        }
        let message = get_message_tx(&tx, message_id)?;
        bump_conversation(&tx, &message.conversation_id)?;
        tx.commit().map_err(ValetError::storage)?;
        Ok(message)
    }

    /// Add a new assistant version answering `parent_id` and make it the
    /// active one. Existing versions are deactivated in the same
    /// transaction.
    pub fn regenerate_version(&self, parent_id: i64, content: &str) -> Result<StoredMessage> {
        let now = Utc::now();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(ValetError::storage)?;

        let parent = get_message_tx(&tx, parent_id)?;
        let max: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM messages
                 WHERE conversation_id = ?1 AND parent_id = ?2",
                params![parent.conversation_id, parent_id],
                |row| row.get(0),
            )
            .map_err(ValetError::storage)?;
        let version = max.unwrap_or(0) + 1;

        tx.execute(
            "UPDATE messages SET is_active_version = 0
             WHERE conversation_id = ?1 AND parent_id = ?2",
            params![parent.conversation_id, parent_id],
        )
        .map_err(ValetError::storage)?;
        tx.execute(
            "INSERT INTO messages
             (conversation_id, user_id, role, content, parent_id, version,
              is_active_version, is_edited, metadata, timestamp)
             VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, 1, 0, NULL, ?6)",
            params![parent.conversation_id, parent.user_id, content, parent_id, version, ts(now)],
        )
        .map_err(ValetError::storage)?;
        let id = tx.last_insert_rowid();

        bump_conversation(&tx, &parent.conversation_id)?;
        tx.commit().map_err(ValetError::storage)?;

        Ok(StoredMessage {
            id,
            conversation_id: parent.conversation_id,
            user_id: parent.user_id,
            role: Role::Assistant,
            content: content.to_string(),
            parent_id: Some(parent_id),
            version,
            is_active_version: true,
            is_edited: false,
            metadata: None,
            timestamp: now,
        })
    }

    /// Make `message_id` the active version of `parent_id`'s group.
    pub fn select_active_version(&self, message_id: i64, parent_id: i64) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(ValetError::storage)?;

        let conversation_id: String = tx
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1 AND parent_id = ?2",
                params![message_id, parent_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ValetError::not_found("message version", message_id.to_string())
                }
                other => ValetError::storage(other),
            })?;

        tx.execute(
            "UPDATE messages SET is_active_version = 0
             WHERE conversation_id = ?1 AND parent_id = ?2",
            params![conversation_id, parent_id],
        )
        .map_err(ValetError::storage)?;
        tx.execute(
            "UPDATE messages SET is_active_version = 1 WHERE id = ?1",
            [message_id],
        )
        .map_err(ValetError::storage)?;

        bump_conversation(&tx, &conversation_id)?;
        tx.commit().map_err(ValetError::storage)?;
        Ok(())
    }

    /// Delete a message. Deleting a user message also deletes every
    /// assistant reply whose `parent_id` points at it.
    pub fn delete(&self, message_id: i64) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(ValetError::storage)?;

        let message = get_message_tx(&tx, message_id)?;
        if message.role == Role::User {
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1 AND parent_id = ?2",
                params![message.conversation_id, message_id],
            )
            .map_err(ValetError::storage)?;
        }
        tx.execute("DELETE FROM messages WHERE id = ?1", [message_id])
            .map_err(ValetError::storage)?;

        bump_conversation(&tx, &message.conversation_id)?;
        tx.commit().map_err(ValetError::storage)?;
        Ok(())
    }

    /// Truncate the conversation after `message_id`: every message with a
    /// strictly later timestamp is deleted. Returns the conversation id.
    pub fn rewind(&self, message_id: i64) -> Result<String> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(ValetError::storage)?;

        let anchor = get_message_tx(&tx, message_id)?;
        let removed = tx
            .execute(
                "DELETE FROM messages WHERE conversation_id = ?1 AND timestamp > ?2",
                params![anchor.conversation_id, ts(anchor.timestamp)],
            )
            .map_err(ValetError::storage)?;

        bump_conversation(&tx, &anchor.conversation_id)?;
        tx.commit().map_err(ValetError::storage)?;

        tracing::info!(
            "⏪ Rewound conversation {} to message {message_id} ({removed} removed)",
            anchor.conversation_id
        );
        Ok(anchor.conversation_id)
    }

    pub fn get(&self, message_id: i64) -> Result<StoredMessage> {
        self.db
            .conn()?
            .query_row(
                &format!("SELECT {MSG_COLUMNS} FROM messages WHERE id = ?1"),
                [message_id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ValetError::not_found("message", message_id.to_string())
                }
                other => ValetError::storage(other),
            })
    }

    /// Conversation history, oldest first. With `include_all_versions`
    /// false, assistant version groups collapse to their active version;
    /// user messages always appear. `limit` keeps the most recent rows.
    pub fn history(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
        include_all_versions: bool,
    ) -> Result<Vec<StoredMessage>> {
        let filter = if include_all_versions {
            ""
        } else {
            "AND (role = 'user' OR is_active_version = 1)"
        };
        let sql = format!(
            "SELECT {MSG_COLUMNS} FROM (
                 SELECT {MSG_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 {filter}
                 ORDER BY timestamp DESC, id DESC LIMIT ?2
             ) ORDER BY timestamp ASC, id ASC"
        );
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(ValetError::storage)?;
        let rows = stmt
            .query_map(params![conversation_id, limit.unwrap_or(u32::MAX)], row_to_message)
            .map_err(ValetError::storage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(ValetError::storage)?);
        }
        Ok(out)
    }

    /// All versions in one group, version ascending.
    pub fn versions(&self, conversation_id: &str, parent_id: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MSG_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND parent_id = ?2 ORDER BY version"
            ))
            .map_err(ValetError::storage)?;
        let rows = stmt
            .query_map(params![conversation_id, parent_id], row_to_message)
            .map_err(ValetError::storage)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(ValetError::storage)?);
        }
        Ok(out)
    }
}

fn bump_conversation(tx: &Transaction<'_>, conversation_id: &str) -> Result<()> {
    let n = tx
        .execute(
            "UPDATE conversations SET updated_at = ?2 WHERE conversation_id = ?1",
            params![conversation_id, ts(Utc::now())],
        )
        .map_err(ValetError::storage)?;
    if n == 0 {
        return Err(ValetError::not_found("conversation", conversation_id));
    }
    Ok(())
}

fn get_message_tx(tx: &Transaction<'_>, message_id: i64) -> Result<StoredMessage> {
    tx.query_row(
        &format!("SELECT {MSG_COLUMNS} FROM messages WHERE id = ?1"),
        [message_id],
        row_to_message,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            ValetError::not_found("message", message_id.to_string())
        }
        other => ValetError::storage(other),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(3)?;
    let metadata: Option<String> = row.get(9)?;
    let timestamp: String = row.get(10)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        content: row.get(4)?,
        parent_id: row.get(5)?,
        version: row.get(6)?,
        is_active_version: row.get::<_, i32>(7)? != 0,
        is_edited: row.get::<_, i32>(8)? != 0,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        timestamp: parse_ts(&timestamp).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_ts(&created_at).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(&updated_at).unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::new(ValetDb::open_in_memory().unwrap())
    }

    fn seed(store: &MessageStore) -> (Conversation, StoredMessage) {
        let conv = store.create_conversation("u1", Some("errands")).unwrap();
        let user_msg = store
            .append(&conv.id, "u1", Role::User, "remind me to stretch", None, None)
            .unwrap();
        (conv, user_msg)
    }

    fn active_ids(store: &MessageStore, conv: &str, parent: i64) -> Vec<i64> {
        store
            .versions(conv, parent)
            .unwrap()
            .into_iter()
            .filter(|m| m.is_active_version)
            .map(|m| m.id)
            .collect()
    }

    #[test]
    fn first_reply_is_active_version_one() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        let reply = store
            .append(&conv.id, "u1", Role::Assistant, "will do", Some(user_msg.id), None)
            .unwrap();
        assert_eq!(reply.version, 1);
        assert!(reply.is_active_version);

        let second = store
            .append(&conv.id, "u1", Role::Assistant, "noted", Some(user_msg.id), None)
            .unwrap();
        assert_eq!(second.version, 2);
        assert!(!second.is_active_version);
        assert_eq!(active_ids(&store, &conv.id, user_msg.id), vec![reply.id]);
    }

    #[test]
    fn regenerate_then_select_swaps_active() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        let v1 = store
            .append(&conv.id, "u1", Role::Assistant, "original", Some(user_msg.id), None)
            .unwrap();

        let v2 = store.regenerate_version(user_msg.id, "regenerated").unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(active_ids(&store, &conv.id, user_msg.id), vec![v2.id]);

        store.select_active_version(v1.id, user_msg.id).unwrap();
        assert_eq!(active_ids(&store, &conv.id, user_msg.id), vec![v1.id]);
    }

    #[test]
    fn select_rejects_message_outside_group() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        let stray = store
            .append(&conv.id, "u1", Role::User, "unrelated", None, None)
            .unwrap();
        let err = store.select_active_version(stray.id, user_msg.id).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn edit_flags_message_without_touching_versions() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        let reply = store
            .append(&conv.id, "u1", Role::Assistant, "typo", Some(user_msg.id), None)
            .unwrap();
        let edited = store.edit(reply.id, "fixed").unwrap();
        assert_eq!(edited.content, "fixed");
        assert!(edited.is_edited);
        assert_eq!(edited.version, 1);
        assert!(edited.is_active_version);
        assert!(store.edit(9999, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_user_message_cascades_to_replies() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        store
            .append(&conv.id, "u1", Role::Assistant, "v1", Some(user_msg.id), None)
            .unwrap();
        store.regenerate_version(user_msg.id, "v2").unwrap();

        let before = store.get_conversation(&conv.id).unwrap().updated_at;
        store.delete(user_msg.id).unwrap();

        assert!(store.history(&conv.id, None, true).unwrap().is_empty());
        let after = store.get_conversation(&conv.id).unwrap().updated_at;
        assert!(after >= before);
    }

    #[test]
    fn rewind_preserves_prefix_only() {
        let store = store();
        let (conv, first) = seed(&store);
        let reply = store
            .append(&conv.id, "u1", Role::Assistant, "ok", Some(first.id), None)
            .unwrap();
        store
            .append(&conv.id, "u1", Role::User, "something later", None, None)
            .unwrap();
        store
            .append(&conv.id, "u1", Role::User, "even later", None, None)
            .unwrap();

        let conv_id = store.rewind(reply.id).unwrap();
        assert_eq!(conv_id, conv.id);

        let history = store.history(&conv.id, None, true).unwrap();
        let ids: Vec<i64> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, reply.id]);
    }

    #[test]
    fn history_collapses_to_active_versions() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        store
            .append(&conv.id, "u1", Role::Assistant, "v1", Some(user_msg.id), None)
            .unwrap();
        let v2 = store.regenerate_version(user_msg.id, "v2").unwrap();

        let collapsed = store.history(&conv.id, None, false).unwrap();
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[1].id, v2.id);

        let full = store.history(&conv.id, None, true).unwrap();
        assert_eq!(full.len(), 3);
    }

    #[test]
    fn history_limit_keeps_most_recent() {
        let store = store();
        let conv = store.create_conversation("u1", None).unwrap();
        for i in 0..4 {
            store
                .append(&conv.id, "u1", Role::User, &format!("m{i}"), None, None)
                .unwrap();
        }
        let recent = store.history(&conv.id, Some(2), true).unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
    }

    #[test]
    fn append_to_missing_conversation_fails() {
        let store = store();
        let err = store
            .append("nope", "u1", Role::User, "hello", None, None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_conversation_takes_messages_with_it() {
        let store = store();
        let (conv, user_msg) = seed(&store);
        store
            .append(&conv.id, "u1", Role::Assistant, "will do", Some(user_msg.id), None)
            .unwrap();

        store.delete_conversation(&conv.id).unwrap();
        assert!(store.get_conversation(&conv.id).unwrap_err().is_not_found());
        assert!(store.get(user_msg.id).unwrap_err().is_not_found());
        assert!(store.delete_conversation(&conv.id).unwrap_err().is_not_found());
    }

    #[test]
    fn clear_for_user_only_touches_that_user() {
        let store = store();
        let (mine, _) = seed(&store);
        store.create_conversation("u1", None).unwrap();
        let theirs = store.create_conversation("u2", None).unwrap();

        assert_eq!(store.clear_for_user("u1").unwrap(), 2);
        assert!(store.get_conversation(&mine.id).unwrap_err().is_not_found());
        assert!(store.get_conversation(&theirs.id).is_ok());
    }
}
