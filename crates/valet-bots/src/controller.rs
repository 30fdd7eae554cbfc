//! Central controller: classifies an incoming message, routes it through
//! the best-matching handlers, persists the user/assistant message pair,
//! and carries out whatever scheduling the winning handler asked for.

use std::sync::Arc;

use valet_core::{
    HandlerRegistry, HandlerReply, MessageContext, Result, Role, Task, TaskScheduler,
};
use valet_notify::NotificationPipeline;
use valet_store::MessageStore;

const HISTORY_CONTEXT: u32 = 20;
const FALLBACK_CAPABILITY: &str = "chat";

/// Outcome of routing one user message.
#[derive(Debug, Clone)]
pub struct ControllerReply {
    pub conversation_id: String,
    pub user_message_id: i64,
    pub assistant_message_id: i64,
    pub response: String,
}

pub struct CentralController {
    registry: Arc<HandlerRegistry>,
    messages: MessageStore,
    pipeline: Arc<NotificationPipeline>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl CentralController {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        messages: MessageStore,
        pipeline: Arc<NotificationPipeline>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            registry,
            messages,
            pipeline,
            scheduler,
        }
    }

    /// Route one user message end to end. Handler failures are isolated:
    /// the next candidate is tried, and the chat fallback answers when
    /// everything else declines.
    pub async fn handle_message(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        text: &str,
    ) -> Result<ControllerReply> {
        let conversation_id = match conversation_id {
            Some(id) => self.messages.get_conversation(id)?.id,
            None => self.messages.create_conversation(user_id, None)?.id,
        };
        let user_message =
            self.messages
                .append(&conversation_id, user_id, Role::User, text, None, None)?;

        let ctx = MessageContext {
            conversation_id: Some(conversation_id.clone()),
            recent: self
                .messages
                .history(&conversation_id, Some(HISTORY_CONTEXT), false)?,
        };

        let (bot_id, reply) = self.route(user_id, text, &ctx).await;
        let response = reply
            .response
            .clone()
            .unwrap_or_else(|| "Done.".to_string());
        self.apply_reply(user_id, &bot_id, reply).await;

        let assistant_message = self.messages.append(
            &conversation_id,
            user_id,
            Role::Assistant,
            &response,
            Some(user_message.id),
            Some(serde_json::json!({ "bot_id": bot_id })),
        )?;

        Ok(ControllerReply {
            conversation_id,
            user_message_id: user_message.id,
            assistant_message_id: assistant_message.id,
            response,
        })
    }

    /// Pick the highest-priority capability whose keywords match, walk its
    /// handlers best-first, and fall back to chat.
    async fn route(&self, user_id: &str, text: &str, ctx: &MessageContext) -> (String, HandlerReply) {
        let mut candidates = match self.classify(text) {
            Some(capability) => self.registry.for_capability(&capability),
            None => Vec::new(),
        };
        candidates.extend(self.registry.for_capability(FALLBACK_CAPABILITY));

        for handler in candidates {
            match handler.process_message(user_id, text, ctx).await {
                Ok(reply) => return (handler.id().to_string(), reply),
                Err(e) => {
                    tracing::warn!("⚠️ Handler {} declined message: {e}", handler.id());
                }
            }
        }

        tracing::warn!("⚠️ No handler produced a reply, using stock answer");
        (
            FALLBACK_CAPABILITY.to_string(),
            HandlerReply::text("I'm not sure how to help with that yet."),
        )
    }

    fn classify(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        let mut best: Option<(i32, String)> = None;
        for handler in self.registry.all() {
            for capability in handler.capabilities() {
                let hit = capability
                    .keywords
                    .iter()
                    .any(|keyword| lower.contains(keyword.as_str()));
                if hit && best.as_ref().is_none_or(|(p, _)| capability.priority > *p) {
                    best = Some((capability.priority, capability.name));
                }
            }
        }
        best.map(|(_, name)| name)
    }

    /// Persist and schedule everything the handler asked for. Individual
    /// failures are logged; the user still gets their reply.
    async fn apply_reply(&self, user_id: &str, bot_id: &str, reply: HandlerReply) {
        for request in reply.scheduled_tasks {
            let mut task = Task::once(
                user_id,
                bot_id,
                request.task_type,
                request.execute_at,
                request.params,
            );
            task.recurring = request.recurring;
            task.interval = request.interval;
            if let Err(e) = self.scheduler.schedule(task).await {
                tracing::warn!("⚠️ Requested task not scheduled: {e}");
            }
        }

        for request in reply.scheduled_notifications {
            let result = match request.send_at {
                Some(send_at) => self
                    .pipeline
                    .schedule_for(user_id, &request.message, send_at, bot_id, request.metadata)
                    .await
                    .map(|_| ()),
                None => self
                    .pipeline
                    .send_now(user_id, &request.message, bot_id, request.metadata)
                    .map(|_| ()),
            };
            if let Err(e) = result {
                tracing::warn!("⚠️ Requested notification dropped: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatHandler, ProactiveHandler, ReminderHandler};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use valet_notify::SessionManager;
    use valet_store::{NotificationStore, ValetDb};

    #[derive(Default)]
    struct RecordingScheduler {
        tasks: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskScheduler for RecordingScheduler {
        async fn schedule(&self, task: Task) -> Result<()> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
        async fn cancel(&self, _task_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn controller() -> (CentralController, Arc<RecordingScheduler>, MessageStore) {
        let db = ValetDb::open_in_memory().unwrap();
        let messages = MessageStore::new(db.clone());
        let sessions = Arc::new(SessionManager::new());
        let pipeline = Arc::new(NotificationPipeline::new(
            NotificationStore::new(db),
            sessions,
        ));
        let scheduler = Arc::new(RecordingScheduler::default());

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(ReminderHandler::new()));
        registry.register(Arc::new(ProactiveHandler::new()));
        registry.register(Arc::new(ChatHandler::new()));

        (
            CentralController::new(
                Arc::new(registry),
                messages.clone(),
                pipeline,
                scheduler.clone(),
            ),
            scheduler,
            messages,
        )
    }

    #[tokio::test]
    async fn reminder_request_routes_and_schedules() {
        let (controller, scheduler, messages) = controller();
        let reply = controller
            .handle_message("u1", None, "remind me to stretch in 5 minutes")
            .await
            .unwrap();

        assert!(reply.response.contains("stretch"));
        let tasks = scheduler.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].bot_id, "reminder");

        let history = messages.history(&reply.conversation_id, None, false).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].parent_id, Some(reply.user_message_id));
    }

    #[tokio::test]
    async fn unmatched_message_falls_back_to_chat() {
        let (controller, scheduler, _messages) = controller();
        let reply = controller
            .handle_message("u1", None, "hello there")
            .await
            .unwrap();
        assert!(reply.response.contains("Hello"));
        assert!(scheduler.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversation_is_reused_when_given() {
        let (controller, _scheduler, messages) = controller();
        let first = controller.handle_message("u1", None, "hello").await.unwrap();
        let second = controller
            .handle_message("u1", Some(&first.conversation_id), "check in on me every 30 minutes")
            .await
            .unwrap();

        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(
            messages.history(&first.conversation_id, None, false).unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let (controller, _scheduler, _messages) = controller();
        let err = controller
            .handle_message("u1", Some("missing"), "hello")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn check_in_request_prefers_proactive_over_chat() {
        let (controller, scheduler, _messages) = controller();
        controller
            .handle_message("u1", None, "please check in on me every 2 hours")
            .await
            .unwrap();
        let tasks = scheduler.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].bot_id, "proactive");
        assert!(tasks[0].recurring);
        assert_eq!(tasks[0].interval, Some(7200));
    }
}
