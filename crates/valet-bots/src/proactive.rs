//! Proactive handler: recurring check-ins the assistant initiates on its
//! own schedule.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use valet_core::{
    Capability, Handler, HandlerReply, MessageContext, NotificationRequest, Result, TaskOutcome,
    TaskRequest, ValetError,
};

use crate::add_seconds;

pub const PROACTIVE_BOT_ID: &str = "proactive";
pub const CHECK_IN: &str = "proactive-check-in";

const CHECK_IN_MESSAGES: &[&str] = &[
    "👋 Just checking in — how is it going?",
    "👋 Quick check-in: anything I can help with?",
    "👋 Still here if you need me. How are things?",
];

pub struct ProactiveHandler {
    pattern: Regex,
}

impl Default for ProactiveHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProactiveHandler {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"(?i)check in (?:on me )?every (\d+)\s*(minutes?|mins?|hours?|hrs?)")
                .expect("check-in pattern is valid"),
        }
    }

    fn parse_interval(&self, text: &str) -> Option<u64> {
        let caps = self.pattern.captures(text)?;
        let amount: u64 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        if unit.starts_with("hour") || unit.starts_with("hr") {
            amount.checked_mul(3600)
        } else {
            amount.checked_mul(60)
        }
    }
}

#[async_trait]
impl Handler for ProactiveHandler {
    fn id(&self) -> &str {
        PROACTIVE_BOT_ID
    }

    fn name(&self) -> &str {
        "Proactive"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability {
            name: "check-ins".into(),
            description: "Recurring proactive check-ins".into(),
            keywords: vec!["check in".into(), "checkin".into(), "check-in".into()],
            priority: 5,
        }]
    }

    fn task_types(&self) -> Vec<String> {
        vec![CHECK_IN.into()]
    }

    async fn process_message(
        &self,
        _user_id: &str,
        text: &str,
        _ctx: &MessageContext,
    ) -> Result<HandlerReply> {
        let Some((interval, first_at)) = self
            .parse_interval(text)
            .and_then(|interval| Some((interval, add_seconds(Utc::now(), interval)?)))
        else {
            return Ok(HandlerReply::text(
                "I can check in on you periodically — try: check in on me every 30 minutes.",
            ));
        };

        let mut reply = HandlerReply::text(format!(
            "Will do — I'll check in every {} minute(s), starting at {}.",
            interval / 60,
            first_at.format("%H:%M:%S")
        ));
        reply.scheduled_tasks.push(TaskRequest {
            task_type: CHECK_IN.into(),
            execute_at: first_at,
            params: json!({ "since": Utc::now().to_rfc3339() }),
            recurring: true,
            interval: Some(interval),
        });
        Ok(reply)
    }

    async fn execute_task(
        &self,
        task_type: &str,
        _params: &serde_json::Value,
    ) -> Result<TaskOutcome> {
        if task_type != CHECK_IN {
            return Err(ValetError::Config(format!(
                "proactive handler cannot execute {task_type}"
            )));
        }
        // Rotate so repeated check-ins don't read identical
        let message =
            CHECK_IN_MESSAGES[Utc::now().timestamp() as usize % CHECK_IN_MESSAGES.len()];

        let mut outcome = TaskOutcome::ok();
        outcome.notifications.push(NotificationRequest {
            message: message.to_string(),
            send_at: None,
            metadata: json!({ "kind": "check-in" }),
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_in_request_schedules_recurring_task() {
        let handler = ProactiveHandler::new();
        let reply = handler
            .process_message("u1", "check in on me every 30 minutes", &MessageContext::default())
            .await
            .unwrap();

        assert_eq!(reply.scheduled_tasks.len(), 1);
        let task = &reply.scheduled_tasks[0];
        assert_eq!(task.task_type, CHECK_IN);
        assert!(task.recurring);
        assert_eq!(task.interval, Some(1800));
    }

    #[tokio::test]
    async fn hours_are_converted() {
        let handler = ProactiveHandler::new();
        assert_eq!(handler.parse_interval("check in every 2 hours"), Some(7200));
        assert_eq!(handler.parse_interval("check in on me every 5 mins"), Some(300));
        assert_eq!(handler.parse_interval("hello"), None);
    }

    #[tokio::test]
    async fn absurd_interval_gets_usage_hint_instead_of_panicking() {
        let handler = ProactiveHandler::new();
        let reply = handler
            .process_message(
                "u1",
                "check in on me every 10000000000000000 minutes",
                &MessageContext::default(),
            )
            .await
            .unwrap();
        assert!(reply.scheduled_tasks.is_empty());
        assert!(reply.response.unwrap().contains("every 30 minutes"));
    }

    #[tokio::test]
    async fn firing_emits_a_check_in() {
        let handler = ProactiveHandler::new();
        let outcome = handler.execute_task(CHECK_IN, &json!({})).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.notifications.len(), 1);
        assert!(outcome.notifications[0].message.contains("👋"));
    }
}
