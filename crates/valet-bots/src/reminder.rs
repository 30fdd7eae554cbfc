//! Reminder handler: parses "remind me to X in N minutes" style requests,
//! schedules a one-shot task, and emits the reminder notification when it
//! fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;
use valet_core::{
    Capability, Handler, HandlerReply, MessageContext, NotificationRequest, Result, TaskOutcome,
    TaskRequest, ValetError,
};

use crate::add_seconds;

pub const REMINDER_BOT_ID: &str = "reminder";
pub const FIRE_REMINDER: &str = "fire-reminder";

pub struct ReminderHandler {
    in_pattern: Regex,
    at_pattern: Regex,
}

impl Default for ReminderHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ReminderHandler {
    pub fn new() -> Self {
        Self {
            in_pattern: Regex::new(
                r"(?i)remind me to (.+?) in (\d+)\s*(seconds?|secs?|minutes?|mins?|hours?|hrs?)",
            )
            .expect("reminder pattern is valid"),
            at_pattern: Regex::new(r"(?i)remind me to (.+?) at (\d{1,2}):(\d{2})\b")
                .expect("reminder pattern is valid"),
        }
    }

    /// Parse a "remind me to X in N units" request into (what, delay
    /// seconds).
    fn parse_in(&self, text: &str) -> Option<(String, u64)> {
        let caps = self.in_pattern.captures(text)?;
        let what = caps[1].trim().to_string();
        let amount: u64 = caps[2].parse().ok()?;
        let unit = caps[3].to_lowercase();
        let seconds = if unit.starts_with("hour") || unit.starts_with("hr") {
            amount.checked_mul(3600)?
        } else if unit.starts_with("min") {
            amount.checked_mul(60)?
        } else {
            amount
        };
        Some((what, seconds))
    }

    /// Parse a "remind me to X at HH:MM" request into the next occurrence
    /// of that wall-clock time (UTC). A time already past today rolls to
    /// tomorrow.
    fn parse_at(&self, text: &str, now: DateTime<Utc>) -> Option<(String, DateTime<Utc>)> {
        let caps = self.at_pattern.captures(text)?;
        let what = caps[1].trim().to_string();
        let hour: u32 = caps[2].parse().ok()?;
        let minute: u32 = caps[3].parse().ok()?;
        let mut when = now.date_naive().and_hms_opt(hour, minute, 0)?.and_utc();
        if when <= now {
            when += chrono::Duration::days(1);
        }
        Some((what, when))
    }
}

#[async_trait]
impl Handler for ReminderHandler {
    fn id(&self) -> &str {
        REMINDER_BOT_ID
    }

    fn name(&self) -> &str {
        "Reminder"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability {
            name: "reminders".into(),
            description: "Set one-off reminders in natural language".into(),
            keywords: vec!["remind".into(), "reminder".into()],
            priority: 10,
        }]
    }

    fn task_types(&self) -> Vec<String> {
        vec![FIRE_REMINDER.into()]
    }

    async fn process_message(
        &self,
        _user_id: &str,
        text: &str,
        _ctx: &MessageContext,
    ) -> Result<HandlerReply> {
        let now = Utc::now();
        let parsed = self
            .parse_in(text)
            .and_then(|(what, seconds)| Some((what, add_seconds(now, seconds)?)))
            .or_else(|| self.parse_at(text, now));
        let Some((what, execute_at)) = parsed else {
            return Ok(HandlerReply::text(
                "Tell me what and when, like: remind me to stretch in 20 minutes, \
                 or remind me to stand up at 14:30.",
            ));
        };

        let mut reply = HandlerReply::text(format!(
            "Got it — I'll remind you to {what} at {}.",
            execute_at.format("%H:%M:%S")
        ));
        reply.scheduled_tasks.push(TaskRequest {
            task_type: FIRE_REMINDER.into(),
            execute_at,
            params: json!({ "text": what }),
            recurring: false,
            interval: None,
        });
        Ok(reply)
    }

    async fn execute_task(
        &self,
        task_type: &str,
        params: &serde_json::Value,
    ) -> Result<TaskOutcome> {
        if task_type != FIRE_REMINDER {
            return Err(ValetError::Config(format!(
                "reminder handler cannot execute {task_type}"
            )));
        }
        let text = params["text"].as_str().unwrap_or("your reminder");
        let mut outcome = TaskOutcome::ok();
        outcome.notifications.push(NotificationRequest {
            message: format!("⏰ Reminder: {text}"),
            send_at: None,
            metadata: json!({ "kind": "reminder" }),
        });
        Ok(outcome)
    }
}
