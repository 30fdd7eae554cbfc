//! Durable task store. The scheduler engine treats this as the source of
//! truth; timers are rebuilt from it on startup.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use valet_core::{Result, Task, ValetError};

use crate::db::{ValetDb, parse_ts, parse_ts_opt, ts, ts_opt};

#[derive(Clone)]
pub struct TaskStore {
    db: ValetDb,
}

impl TaskStore {
    pub fn new(db: ValetDb) -> Self {
        Self { db }
    }

    /// Persist a new task. Rejects id collisions with `DuplicateId`.
    pub fn insert(&self, task: &Task) -> Result<()> {
        let result = self.db.conn()?.execute(
            "INSERT INTO tasks
             (id, user_id, bot_id, task_type, execute_at, params, recurring,
              interval, last_executed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.user_id,
                task.bot_id,
                task.task_type,
                ts(task.execute_at),
                task.params.to_string(),
                task.recurring as i32,
                task.interval.map(|i| i as i64),
                ts_opt(task.last_executed_at),
                ts(task.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ValetError::DuplicateId(task.id.clone()))
            }
            Err(e) => Err(ValetError::storage(e)),
        }
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.db
            .conn()?
            .query_row(
                "SELECT id, user_id, bot_id, task_type, execute_at, params, recurring,
                        interval, last_executed_at, created_at
                 FROM tasks WHERE id = ?1",
                [id],
                row_to_task,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ValetError::not_found("task", id),
                other => ValetError::storage(other),
            })
    }

    /// Remove a task. Returns true if it existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let n = self
            .db
            .conn()?
            .execute("DELETE FROM tasks WHERE id = ?1", [id])
            .map_err(ValetError::storage)?;
        Ok(n > 0)
    }

    /// All tasks, soonest first. Used by startup recovery.
    pub fn list_all(&self) -> Result<Vec<Task>> {
        self.query(
            "SELECT id, user_id, bot_id, task_type, execute_at, params, recurring,
                    interval, last_executed_at, created_at
             FROM tasks ORDER BY execute_at",
            params![],
        )
    }

    /// A user's pending tasks, soonest first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<Task>> {
        self.query(
            "SELECT id, user_id, bot_id, task_type, execute_at, params, recurring,
                    interval, last_executed_at, created_at
             FROM tasks WHERE user_id = ?1 ORDER BY execute_at",
            params![user_id],
        )
    }

    /// Re-point a task's next firing time.
    pub fn update_execute_at(&self, id: &str, execute_at: DateTime<Utc>) -> Result<()> {
        let n = self
            .db
            .conn()?
            .execute(
                "UPDATE tasks SET execute_at = ?2 WHERE id = ?1",
                params![id, ts(execute_at)],
            )
            .map_err(ValetError::storage)?;
        if n == 0 {
            return Err(ValetError::not_found("task", id));
        }
        Ok(())
    }

    /// Record that a task just fired. `NotFound` when it was removed in
    /// the meantime; callers treat that as non-fatal.
    pub fn touch_executed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let n = self
            .db
            .conn()?
            .execute(
                "UPDATE tasks SET last_executed_at = ?2 WHERE id = ?1",
                params![id, ts(at)],
            )
            .map_err(ValetError::storage)?;
        if n == 0 {
            return Err(ValetError::not_found("task", id));
        }
        Ok(())
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Task>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(sql).map_err(ValetError::storage)?;
        let rows = stmt
            .query_map(args, row_to_task)
            .map_err(ValetError::storage)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(ValetError::storage)?);
        }
        Ok(tasks)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let execute_at: String = row.get(4)?;
    let params_str: String = row.get(5)?;
    let last_executed_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        bot_id: row.get(2)?,
        task_type: row.get(3)?,
        execute_at: parse_ts(&execute_at).unwrap_or_else(|_| Utc::now()),
        params: serde_json::from_str(&params_str).unwrap_or_default(),
        recurring: row.get::<_, i32>(6)? != 0,
        interval: row.get::<_, Option<i64>>(7)?.map(|i| i as u64),
        last_executed_at: parse_ts_opt(last_executed_at).unwrap_or(None),
        created_at: parse_ts(&created_at).unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> TaskStore {
        TaskStore::new(ValetDb::open_in_memory().unwrap())
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let store = store();
        let task = Task::once("u1", "reminder", "fire-reminder", Utc::now(), json!({"n": 1}));
        store.insert(&task).unwrap();

        let loaded = store.get(&task.id).unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert_eq!(loaded.params, json!({"n": 1}));
        assert!(!loaded.recurring);

        assert!(store.remove(&task.id).unwrap());
        assert!(!store.remove(&task.id).unwrap());
        assert!(store.get(&task.id).unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let store = store();
        let task = Task::once("u1", "reminder", "fire-reminder", Utc::now(), json!({}));
        store.insert(&task).unwrap();
        let err = store.insert(&task).unwrap_err();
        assert!(matches!(err, ValetError::DuplicateId(id) if id == task.id));
    }

    #[test]
    fn listing_orders_by_execute_at() {
        let store = store();
        let now = Utc::now();
        let late = Task::once("u1", "b", "t", now + chrono::Duration::minutes(10), json!({}));
        let soon = Task::once("u1", "b", "t", now + chrono::Duration::minutes(1), json!({}));
        let other = Task::once("u2", "b", "t", now, json!({}));
        store.insert(&late).unwrap();
        store.insert(&soon).unwrap();
        store.insert(&other).unwrap();

        let mine = store.list_for_user("u1").unwrap();
        assert_eq!(
            mine.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![soon.id.as_str(), late.id.as_str()]
        );
        assert_eq!(store.list_all().unwrap().len(), 3);
    }

    #[test]
    fn update_and_touch_persist() {
        let store = store();
        let task = Task::recurring("u1", "proactive", "tick", Utc::now(), 60, json!({}));
        store.insert(&task).unwrap();

        let next = task.execute_at + chrono::Duration::seconds(60);
        store.update_execute_at(&task.id, next).unwrap();
        let fired_at = Utc::now();
        store.touch_executed(&task.id, fired_at).unwrap();

        // Stored precision is microseconds
        let loaded = store.get(&task.id).unwrap();
        assert_eq!(loaded.execute_at.timestamp_micros(), next.timestamp_micros());
        assert_eq!(
            loaded.last_executed_at.map(|t| t.timestamp_micros()),
            Some(fired_at.timestamp_micros())
        );
        assert_eq!(loaded.interval, Some(60));
    }

    #[test]
    fn update_missing_task_is_not_found() {
        let store = store();
        let err = store.update_execute_at("nope", Utc::now()).unwrap_err();
        assert!(err.is_not_found());
        let err = store.touch_executed("nope", Utc::now()).unwrap_err();
        assert!(err.is_not_found());
    }
}
