//! Notification pipeline: persist first, then fan out.
//!
//! Deferred sends become a one-shot `deliver-notification` task owned by
//! the internal notifier id; when it fires, delivery is guarded by the
//! store's atomic claim, so duplicate firings never send twice.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde_json::json;
use valet_core::{Notification, Result, Task, TaskScheduler};
use valet_store::NotificationStore;

use crate::sessions::SessionManager;

/// Internal bot id stamped on deferred-delivery tasks.
pub const NOTIFIER_BOT_ID: &str = "notifier";
/// Task type dispatched back into [`NotificationPipeline::deliver_scheduled`].
pub const DELIVER_TASK_TYPE: &str = "deliver-notification";

pub struct NotificationPipeline {
    store: NotificationStore,
    sessions: Arc<SessionManager>,
    /// Wired after construction; the scheduler engine depends on this
    /// pipeline, so it cannot be passed to the constructor.
    scheduler: OnceLock<Arc<dyn TaskScheduler>>,
}

impl NotificationPipeline {
    pub fn new(store: NotificationStore, sessions: Arc<SessionManager>) -> Self {
        Self {
            store,
            sessions,
            scheduler: OnceLock::new(),
        }
    }

    /// Wire the scheduler used for deferred sends. Without it,
    /// `schedule_for` still persists the notification but delivery waits
    /// for the user's next connect.
    pub fn set_scheduler(&self, scheduler: Arc<dyn TaskScheduler>) {
        if self.scheduler.set(scheduler).is_err() {
            tracing::warn!("⚠️ Notification scheduler already set, ignoring");
        }
    }

    /// Persist and deliver immediately. Returns the notification id even
    /// when no session is live (store-and-forget).
    pub fn send_now(
        &self,
        user_id: &str,
        message: &str,
        source_bot_id: &str,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        let notification = self
            .store
            .insert(user_id, message, source_bot_id, metadata, None)?;
        self.store.claim_delivered(notification.id, Utc::now())?;
        let reached = self
            .sessions
            .broadcast_to_user(user_id, &payload(&notification));
        tracing::info!(
            "📨 Notification {} sent to {reached} session(s) of {user_id}",
            notification.id
        );
        Ok(notification.id)
    }

    /// Persist for later delivery and schedule the delivery task.
    pub async fn schedule_for(
        &self,
        user_id: &str,
        message: &str,
        send_at: DateTime<Utc>,
        source_bot_id: &str,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        let notification =
            self.store
                .insert(user_id, message, source_bot_id, metadata, Some(send_at))?;

        match self.scheduler.get() {
            Some(scheduler) => {
                let task = Task::once(
                    user_id,
                    NOTIFIER_BOT_ID,
                    DELIVER_TASK_TYPE,
                    send_at,
                    json!({ "notification_id": notification.id }),
                );
                scheduler.schedule(task).await?;
                tracing::info!(
                    "🕐 Notification {} deferred until {send_at}",
                    notification.id
                );
            }
            None => {
                tracing::warn!(
                    "⚠️ No scheduler wired; notification {} stays queued until next connect",
                    notification.id
                );
            }
        }
        Ok(notification.id)
    }

    /// Deliver a previously deferred notification. Idempotent: only the
    /// call that wins the claim fans out. Returns whether this call
    /// delivered it.
    pub fn deliver_scheduled(&self, notification_id: i64) -> Result<bool> {
        let notification = self.store.get(notification_id)?;
        if !self.store.claim_delivered(notification_id, Utc::now())? {
            tracing::debug!("Notification {notification_id} already delivered, skipping");
            return Ok(false);
        }
        let reached = self
            .sessions
            .broadcast_to_user(&notification.user_id, &payload(&notification));
        tracing::info!(
            "📨 Deferred notification {notification_id} delivered to {reached} session(s)"
        );
        Ok(true)
    }

    /// Deliver everything already due for a user, e.g. when a session
    /// connects. Returns how many notifications were delivered.
    pub fn deliver_pending(&self, user_id: &str) -> Result<usize> {
        let pending = self.store.pending_for_user(user_id, Utc::now())?;
        let mut delivered = 0;
        for notification in pending {
            if self.store.claim_delivered(notification.id, Utc::now())? {
                self.sessions
                    .broadcast_to_user(user_id, &payload(&notification));
                delivered += 1;
            }
        }
        if delivered > 0 {
            tracing::info!("📬 Delivered {delivered} queued notification(s) to {user_id}");
        }
        Ok(delivered)
    }

    pub fn mark_read(&self, notification_id: i64) -> Result<bool> {
        self.store.mark_read(notification_id, Utc::now())
    }

    pub fn list_for_user(
        &self,
        user_id: &str,
        include_read: bool,
        limit: u32,
    ) -> Result<Vec<Notification>> {
        self.store.list_for_user(user_id, include_read, limit)
    }
}

fn payload(notification: &Notification) -> serde_json::Value {
    json!({
        "type": "notification",
        "id": notification.id,
        "message": notification.message,
        "source": notification.source_bot_id,
        "metadata": notification.metadata,
        "created_at": notification.created_at.to_rfc3339(),
    })
}
