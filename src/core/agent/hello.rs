use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::core::types::InboundMessage;
use crate::core::worker::{WorkerContext, WorkerHooks, WorkerState};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloState {
    pub last_message: Option<serde_json::Value>,
    pub handled: u64,
}

impl WorkerState for HelloState {}

/// Minimal demo worker: remembers the last payload and greets the sender.
pub struct HelloAgent;

#[async_trait]
impl WorkerHooks for HelloAgent {
    type State = HelloState;

    async fn handle_message(
        &mut self,
        ctx: &WorkerContext,
        state: &mut HelloState,
        message: &InboundMessage,
    ) -> Result<()> {
        info!("Received message {} from {}", message.id, message.sender);
        state.last_message = Some(message.payload.clone());
        state.handled += 1;
        ctx.messaging
            .reply(message, json!({ "response": "Hello from agent!" }))
            .await;
        Ok(())
    }
}
