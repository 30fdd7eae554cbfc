//! # Valet Core
//!
//! Shared foundation for the Valet assistant backend: configuration,
//! the error taxonomy, the durable data model (tasks, notifications,
//! messages, conversations), and the handler trait + registry that the
//! scheduler and the routing layer dispatch through.

pub mod config;
pub mod error;
pub mod handler;
pub mod types;

pub use config::{TimerStrategy, ValetConfig};
pub use error::{Result, ValetError};
pub use handler::{
    Capability, Handler, HandlerRegistry, HandlerReply, MessageContext, NotificationRequest,
    TaskOutcome, TaskRequest, TaskScheduler,
};
pub use types::{Conversation, Notification, Role, StoredMessage, Task};
