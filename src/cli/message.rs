use anyhow::{Result, bail};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::parse_message_args;
use crate::core::config::AgentboxConfig;
use crate::core::messaging::{Messaging, inbox_key};
use crate::core::store::SqliteStore;
use crate::core::terminal::{print_info, print_success};
use crate::core::types::InboundMessage;

/// Human-readable form of a reply payload.
fn render_reply(payload: &Value) -> String {
    for field in ["text", "response"] {
        if let Some(text) = payload.get(field).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
}

pub async fn run_message_command(args: &[String], config: &AgentboxConfig) -> Result<()> {
    let parsed = parse_message_args(args, 2)?;
    let store = Arc::new(SqliteStore::open(config.db_path()).await?);

    let suffix = Uuid::new_v4().simple().to_string();
    let client = Messaging::new(store, "cli", &format!("{}-{}", parsed.from, &suffix[..8]));

    let message_id = Uuid::new_v4().to_string();
    let message = InboundMessage::new(
        message_id.clone(),
        parsed.from.clone(),
        "message",
        json!({ "text": parsed.text }),
    )
    .with_reply_to(client.inbox());
    let destination = inbox_key(&parsed.worker_type, &parsed.worker_id);
    client.send(&destination, &message).await?;
    print_info(&format!("Sent {} to {}", message_id, destination));

    let deadline = Instant::now() + Duration::from_secs(parsed.timeout_secs);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!(
                "No reply to {} within {}s",
                message_id,
                parsed.timeout_secs
            );
        }
        let Some(reply) = client.receive_timeout(remaining).await else {
            continue;
        };
        if reply.reply_to.as_deref() != Some(message_id.as_str()) {
            debug!("Ignoring uncorrelated message {}", reply.id);
            continue;
        }
        print_success(&format!("{}: {}", reply.sender, render_reply(&reply.payload)));
        return Ok(());
    }
}
