use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::llm::{ChatMessage, ChatModel};
use crate::core::types::InboundMessage;
use crate::core::worker::{WorkerContext, WorkerHooks, WorkerState};

/// Turns kept per sender; older ones fall off the front.
pub const HISTORY_LIMIT: usize = 10;

const SYSTEM_PROMPT: &str =
    "You are a helpful, friendly chatbot. Respond to the following conversation and message.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatbotState {
    pub conversations: BTreeMap<String, Vec<ChatMessage>>,
}

impl WorkerState for ChatbotState {}

impl ChatbotState {
    fn record(&mut self, sender: &str, turn: ChatMessage) {
        let history = self.conversations.entry(sender.to_string()).or_default();
        history.push(turn);
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }
    }

    fn prompt(&self, sender: &str, text: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        if let Some(history) = self.conversations.get(sender) {
            messages.extend(history.iter().cloned());
        }
        messages.push(ChatMessage::user(text));
        messages
    }
}

/// Per-client conversational worker.
pub struct ChatbotAgent {
    model: Arc<dyn ChatModel>,
}

impl ChatbotAgent {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl WorkerHooks for ChatbotAgent {
    type State = ChatbotState;

    async fn initialize(&mut self, ctx: &WorkerContext, state: &mut ChatbotState) -> Result<()> {
        info!(
            "Chatbot {} ready with {} conversation(s)",
            ctx.agent_id,
            state.conversations.len()
        );
        Ok(())
    }

    async fn handle_message(
        &mut self,
        ctx: &WorkerContext,
        state: &mut ChatbotState,
        message: &InboundMessage,
    ) -> Result<()> {
        let Some(text) = message.text() else {
            warn!("Message {} has no text payload, ignoring", message.id);
            return Ok(());
        };

        let answer = self.model.generate(&state.prompt(&message.sender, text)).await?;
        state.record(&message.sender, ChatMessage::user(text));
        state.record(&message.sender, ChatMessage::assistant(answer.clone()));

        ctx.messaging.reply(message, json!({ "text": answer })).await;
        Ok(())
    }
}
