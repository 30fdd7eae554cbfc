//! Core data types shared by the stores, scheduler, and gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable scheduled task. One-shot or recurring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    /// Handler that executes this task when it fires.
    pub bot_id: String,
    pub task_type: String,
    pub execute_at: DateTime<Utc>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub recurring: bool,
    /// Repeat interval in seconds. Required when `recurring` is true.
    pub interval: Option<u64>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Build a one-shot task with a fresh id.
    pub fn once(
        user_id: impl Into<String>,
        bot_id: impl Into<String>,
        task_type: impl Into<String>,
        execute_at: DateTime<Utc>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            bot_id: bot_id.into(),
            task_type: task_type.into(),
            execute_at,
            params,
            recurring: false,
            interval: None,
            last_executed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Build a recurring task with a fresh id.
    pub fn recurring(
        user_id: impl Into<String>,
        bot_id: impl Into<String>,
        task_type: impl Into<String>,
        execute_at: DateTime<Utc>,
        interval_secs: u64,
        params: serde_json::Value,
    ) -> Self {
        Self {
            recurring: true,
            interval: Some(interval_secs),
            ..Self::once(user_id, bot_id, task_type, execute_at, params)
        }
    }
}

/// A queued or delivered user notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: String,
    pub message: String,
    pub source_bot_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Set when delivery was deferred to a future instant.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A conversation message, one version within its sibling group.
///
/// Messages sharing a `parent_id` within a conversation form a version
/// group; exactly one member is the active version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub parent_id: Option<i64>,
    pub version: i64,
    pub is_active_version: bool,
    pub is_edited: bool,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A conversation thread owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_tasks_get_unique_ids() {
        let now = Utc::now();
        let a = Task::once("u1", "reminder", "fire", now, serde_json::json!({}));
        let b = Task::once("u1", "reminder", "fire", now, serde_json::json!({}));
        assert_ne!(a.id, b.id);
        assert!(!a.recurring);
        assert!(a.interval.is_none());
    }

    #[test]
    fn recurring_carries_interval() {
        let t = Task::recurring("u1", "proactive", "tick", Utc::now(), 60, serde_json::json!({}));
        assert!(t.recurring);
        assert_eq!(t.interval, Some(60));
    }

    #[test]
    fn role_round_trips_lowercase() {
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::parse("system"), None);
    }
}
