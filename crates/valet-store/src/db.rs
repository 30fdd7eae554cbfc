//! Shared SQLite connection and schema migrations.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use valet_core::{Result, ValetError};

/// Shared handle to the Valet database. Cheap to clone; all stores hold a
/// clone and serialize access through the inner mutex.
#[derive(Clone)]
pub struct ValetDb {
    conn: Arc<Mutex<Connection>>,
}

impl ValetDb {
    /// Open or create the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(ValetError::storage)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(ValetError::storage)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        tracing::info!("💾 Database ready: {}", path.display());
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(ValetError::storage)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(ValetError::storage)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Durable scheduled tasks (one-shot and recurring)
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                execute_at TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',   -- JSON payload
                recurring INTEGER NOT NULL DEFAULT 0,
                interval INTEGER,                    -- seconds, recurring only
                last_executed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_execute_at ON tasks(execute_at);

            -- Notification queue and delivery history
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                message TEXT NOT NULL,
                source_bot_id TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                scheduled_for TEXT,
                delivered_at TEXT,
                read_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications(user_id, delivered_at);

            -- Conversation threads
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user
                ON conversations(user_id, updated_at);

            -- Messages with version groups (parent_id + version)
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                parent_id INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                is_active_version INTEGER NOT NULL DEFAULT 1,
                is_edited INTEGER NOT NULL DEFAULT 0,
                metadata TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (conversation_id)
                    REFERENCES conversations(conversation_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_group
                ON messages(conversation_id, parent_id);
         ",
            )
            .map_err(ValetError::storage)?;
        Ok(())
    }

    /// Lock the connection. Poisoned locks surface as storage errors.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ValetError::Storage("database lock poisoned".into()))
    }
}

/// Serialize a timestamp for storage. Microsecond precision keeps string
/// ordering identical to time ordering.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_opt(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

/// Parse a stored timestamp.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ValetError::Storage(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}
