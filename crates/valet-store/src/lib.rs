//! SQLite-backed persistence for Valet: durable tasks, the notification
//! queue, and branching conversation history.
//!
//! All stores share one [`ValetDb`] connection handle. Timestamps are
//! stored as RFC 3339 strings with microsecond precision, so lexicographic
//! comparison in SQL matches chronological order.

pub mod db;
pub mod messages;
pub mod notifications;
pub mod tasks;

pub use db::ValetDb;
pub use messages::MessageStore;
pub use notifications::NotificationStore;
pub use tasks::TaskStore;
