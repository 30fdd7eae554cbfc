//! Fallback small-talk handler. Catches everything the specialized
//! handlers don't claim.

use async_trait::async_trait;
use valet_core::{
    Capability, Handler, HandlerReply, MessageContext, Result, TaskOutcome, ValetError,
};

pub const CHAT_BOT_ID: &str = "chat";

#[derive(Default)]
pub struct ChatHandler;

impl ChatHandler {
    pub fn new() -> Self {
        Self
    }

    fn reply_for(text: &str) -> String {
        let lower = text.to_lowercase();
        if lower.contains("hello") || lower.contains("hi ") || lower == "hi" {
            "Hello! I can set reminders, check in on you, and keep track of our conversation."
                .into()
        } else if lower.contains("thank") {
            "Anytime!".into()
        } else if lower.contains("help") || lower.contains("what can you do") {
            "Try: \"remind me to stretch in 20 minutes\" or \"check in on me every hour\".".into()
        } else {
            "Noted. Ask me to remind you about something, or say \"help\" to see what I can do."
                .into()
        }
    }
}

#[async_trait]
impl Handler for ChatHandler {
    fn id(&self) -> &str {
        CHAT_BOT_ID
    }

    fn name(&self) -> &str {
        "Chat"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability {
            name: "chat".into(),
            description: "General conversation fallback".into(),
            keywords: Vec::new(),
            priority: 1,
        }]
    }

    async fn process_message(
        &self,
        _user_id: &str,
        text: &str,
        _ctx: &MessageContext,
    ) -> Result<HandlerReply> {
        Ok(HandlerReply::text(Self::reply_for(text)))
    }

    async fn execute_task(
        &self,
        task_type: &str,
        _params: &serde_json::Value,
    ) -> Result<TaskOutcome> {
        Err(ValetError::Config(format!(
            "chat handler owns no task type (got {task_type})"
        )))
    }
}
