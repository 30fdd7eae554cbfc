//! Notification delivery: durable records, immediate and deferred sends,
//! and fan-out to connected WebSocket sessions.

pub mod pipeline;
pub mod sessions;

pub use pipeline::{DELIVER_TASK_TYPE, NOTIFIER_BOT_ID, NotificationPipeline};
pub use sessions::SessionManager;
