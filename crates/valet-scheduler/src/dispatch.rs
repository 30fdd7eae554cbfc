//! Executor dispatch: resolve a fired task's handler, run it, and apply
//! whatever it produced. Failures are contained to the one task — logged,
//! never retried, never propagated.

use std::sync::Arc;

use valet_core::{HandlerRegistry, Task, TaskOutcome, TaskScheduler, ValetError};
use valet_notify::{DELIVER_TASK_TYPE, NotificationPipeline};

/// Execute one fired task. Infallible by contract: every error ends here
/// as a log line.
pub async fn execute(
    task: &Task,
    registry: &HandlerRegistry,
    pipeline: &NotificationPipeline,
    scheduler: Arc<dyn TaskScheduler>,
) {
    // Deferred-delivery tasks are owned by the pipeline, not a handler.
    if task.task_type == DELIVER_TASK_TYPE {
        let notification_id = task.params["notification_id"].as_i64().unwrap_or(-1);
        if let Err(e) = pipeline.deliver_scheduled(notification_id) {
            tracing::warn!(
                "⚠️ Deferred delivery failed for task {} (notification {notification_id}): {e}",
                task.id
            );
        }
        return;
    }

    let Some(handler) = registry.get(&task.bot_id) else {
        let err = ValetError::HandlerUnavailable(task.bot_id.clone());
        tracing::warn!("⚠️ Dropping task {}: {err}", task.id);
        return;
    };

    match handler.execute_task(&task.task_type, &task.params).await {
        Ok(outcome) => {
            if !outcome.success {
                tracing::warn!("⚠️ Task {} reported failure (no retry)", task.id);
            }
            apply_outcome(task, outcome, pipeline, scheduler).await;
        }
        Err(e) => {
            tracing::error!("❌ Task {} failed in handler {}: {e}", task.id, task.bot_id);
        }
    }
}

/// Emit the notifications and follow-up tasks an execution produced.
async fn apply_outcome(
    task: &Task,
    outcome: TaskOutcome,
    pipeline: &NotificationPipeline,
    scheduler: Arc<dyn TaskScheduler>,
) {
    for request in outcome.notifications {
        let result = match request.send_at {
            Some(send_at) => pipeline
                .schedule_for(
                    &task.user_id,
                    &request.message,
                    send_at,
                    &task.bot_id,
                    request.metadata,
                )
                .await
                .map(|_| ()),
            None => pipeline
                .send_now(&task.user_id, &request.message, &task.bot_id, request.metadata)
                .map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!("⚠️ Notification from task {} dropped: {e}", task.id);
        }
    }

    for follow_up in outcome.follow_ups {
        let mut next = Task::once(
            &task.user_id,
            &task.bot_id,
            follow_up.task_type,
            follow_up.execute_at,
            follow_up.params,
        );
        next.recurring = follow_up.recurring;
        next.interval = follow_up.interval;
        if let Err(e) = scheduler.schedule(next).await {
            tracing::warn!("⚠️ Follow-up from task {} not scheduled: {e}", task.id);
        }
    }
}
