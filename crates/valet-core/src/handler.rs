//! Handler framework — capability-driven message routing and task execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{StoredMessage, Task};

/// One thing a handler can do, with keywords used for routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    /// Lowercase substrings matched against incoming messages.
    pub keywords: Vec<String>,
    /// Higher wins when several handlers claim the same capability.
    pub priority: i32,
}

/// A task a handler wants scheduled on its own behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    pub execute_at: DateTime<Utc>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub recurring: bool,
    pub interval: Option<u64>,
}

/// A notification a handler wants sent, now or later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub message: String,
    /// None means deliver immediately.
    pub send_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What a handler produced for one user message.
#[derive(Debug, Clone, Default)]
pub struct HandlerReply {
    pub response: Option<String>,
    pub scheduled_tasks: Vec<TaskRequest>,
    pub scheduled_notifications: Vec<NotificationRequest>,
}

impl HandlerReply {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
            ..Self::default()
        }
    }
}

/// What a handler produced for one fired task.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub notifications: Vec<NotificationRequest>,
    /// Additional tasks to schedule as a result of this execution.
    pub follow_ups: Vec<TaskRequest>,
}

impl TaskOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

/// Conversation context handed to a handler with each message.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub conversation_id: Option<String>,
    /// Recent active-path messages, oldest first.
    pub recent: Vec<StoredMessage>,
}

/// A pluggable assistant handler: reacts to user messages and executes
/// the scheduled tasks it owns.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable id used as `bot_id` on tasks and notifications.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<Capability>;

    /// Task types this handler executes when they fire.
    fn task_types(&self) -> Vec<String> {
        Vec::new()
    }

    async fn process_message(
        &self,
        user_id: &str,
        text: &str,
        ctx: &MessageContext,
    ) -> Result<HandlerReply>;

    async fn execute_task(&self, task_type: &str, params: &serde_json::Value)
    -> Result<TaskOutcome>;
}

/// Scheduling seam: implemented by the scheduler engine, consumed by the
/// notification pipeline and the controller. Avoids a circular dependency
/// between the notify and scheduler crates.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(&self, task: Task) -> Result<()>;
    /// Returns true if a task with this id was removed.
    async fn cancel(&self, task_id: &str) -> Result<bool>;
}

/// Registry of handlers with capability and task-type routing maps.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    /// Ids in registration order, for deterministic tie-breaking.
    order: Vec<String>,
    /// capability name -> handler ids, priority descending.
    capability_map: HashMap<String, Vec<String>>,
    /// task type -> handler id.
    task_map: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, indexing its capabilities and task types.
    /// Re-registering an id replaces the previous handler.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let id = handler.id().to_string();
        tracing::info!("🔌 Registered handler: {} ({})", handler.name(), id);

        if !self.order.contains(&id) {
            self.order.push(id.clone());
        }
        for cap in handler.capabilities() {
            let entry = self.capability_map.entry(cap.name.clone()).or_default();
            if !entry.contains(&id) {
                entry.push(id.clone());
            }
        }
        for task_type in handler.task_types() {
            self.task_map.insert(task_type, id.clone());
        }
        self.handlers.insert(id, handler);

        self.resort_capabilities();
    }

    fn resort_capabilities(&mut self) {
        let seq: HashMap<&String, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        for (capability, ids) in self.capability_map.iter_mut() {
            ids.sort_by(|a, b| {
                let pa = Self::declared_priority(self.handlers.get(a), capability);
                let pb = Self::declared_priority(self.handlers.get(b), capability);
                pb.cmp(&pa)
                    .then_with(|| seq.get(a).cmp(&seq.get(b)))
            });
        }
    }

    /// The priority a handler declared for one specific capability.
    fn declared_priority(handler: Option<&Arc<dyn Handler>>, capability: &str) -> i32 {
        handler
            .map(|h| {
                h.capabilities()
                    .iter()
                    .filter(|c| c.name == capability)
                    .map(|c| c.priority)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(id).cloned()
    }

    /// All handlers in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Handler>> {
        self.order
            .iter()
            .filter_map(|id| self.handlers.get(id).cloned())
            .collect()
    }

    /// Handlers claiming a capability, best first.
    pub fn for_capability(&self, capability: &str) -> Vec<Arc<dyn Handler>> {
        self.capability_map
            .get(capability)
            .map(|ids| ids.iter().filter_map(|id| self.handlers.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Handler that owns a task type, if any.
    pub fn for_task_type(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.task_map
            .get(task_type)
            .and_then(|id| self.handlers.get(id).cloned())
    }

    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capability_map.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        id: &'static str,
        /// (capability name, priority) pairs this handler declares.
        caps: Vec<(&'static str, i32)>,
    }

    impl Fake {
        fn new(id: &'static str, priority: i32) -> Self {
            Self {
                id,
                caps: vec![("reminders", priority)],
            }
        }
    }

    #[async_trait]
    impl Handler for Fake {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.id
        }
        fn capabilities(&self) -> Vec<Capability> {
            self.caps
                .iter()
                .map(|(name, priority)| Capability {
                    name: (*name).into(),
                    description: String::new(),
                    keywords: vec!["remind".into()],
                    priority: *priority,
                })
                .collect()
        }
        fn task_types(&self) -> Vec<String> {
            vec![format!("{}-fire", self.id)]
        }
        async fn process_message(
            &self,
            _user_id: &str,
            _text: &str,
            _ctx: &MessageContext,
        ) -> Result<HandlerReply> {
            Ok(HandlerReply::text("ok"))
        }
        async fn execute_task(
            &self,
            _task_type: &str,
            _params: &serde_json::Value,
        ) -> Result<TaskOutcome> {
            Ok(TaskOutcome::ok())
        }
    }

    #[test]
    fn capability_map_sorts_by_priority_then_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Fake::new("low", 1)));
        registry.register(Arc::new(Fake::new("high", 9)));
        registry.register(Arc::new(Fake::new("also-low", 1)));

        let ids: Vec<String> = registry
            .for_capability("reminders")
            .iter()
            .map(|h| h.id().to_string())
            .collect();
        assert_eq!(ids, vec!["high", "low", "also-low"]);
    }

    #[test]
    fn ordering_uses_the_priority_declared_for_that_capability() {
        // "both" is top for reminders but declares search at a low
        // priority; it must not drag its reminders rank into search.
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Fake {
            id: "both",
            caps: vec![("reminders", 9), ("search", 1)],
        }));
        registry.register(Arc::new(Fake {
            id: "searcher",
            caps: vec![("search", 5)],
        }));

        let search: Vec<String> = registry
            .for_capability("search")
            .iter()
            .map(|h| h.id().to_string())
            .collect();
        assert_eq!(search, vec!["searcher", "both"]);
        assert_eq!(registry.for_capability("reminders")[0].id(), "both");
    }

    #[test]
    fn task_map_routes_to_owner() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Fake::new("rem", 1)));
        assert_eq!(registry.for_task_type("rem-fire").unwrap().id(), "rem");
        assert!(registry.for_task_type("unknown").is_none());
    }

    #[test]
    fn unknown_capability_is_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.for_capability("search").is_empty());
        assert!(registry.capability_names().is_empty());
    }
}
