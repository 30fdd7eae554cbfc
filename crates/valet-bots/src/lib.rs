//! Built-in handlers (reminders, proactive check-ins, small talk) and the
//! controller that classifies incoming messages and routes them.

pub mod chat;
pub mod controller;
pub mod proactive;
pub mod reminder;

pub use chat::ChatHandler;
pub use controller::{CentralController, ControllerReply};
pub use proactive::ProactiveHandler;
pub use reminder::ReminderHandler;

/// Checked deadline arithmetic: `None` when the delay exceeds chrono's
/// representable range instead of panicking mid-request.
pub(crate) fn add_seconds(
    from: chrono::DateTime<chrono::Utc>,
    seconds: u64,
) -> Option<chrono::DateTime<chrono::Utc>> {
    let delay = i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)?;
    from.checked_add_signed(delay)
}
