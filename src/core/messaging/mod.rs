//! Message transport: one ordered inbox per worker on top of an append-only
//! log, with reply routing back to the sender.

#[cfg(test)]
mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, warn};

use crate::core::types::InboundMessage;

#[cfg(test)]
pub use memory::InMemoryBroker;

pub const READ_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    pub data: String,
}

/// Per-key ordered append log. Consumers track their own cursor.
#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Append an entry and return its id. Ids grow strictly within a broker.
    async fn append(&self, stream_key: &str, data: &str) -> Result<u64>;

    /// Wait for the first entry on `stream_key` whose id is greater than `after`.
    async fn read_next(&self, stream_key: &str, after: u64) -> Result<LogEntry>;
}

/// Inbox of a worker: `agent:<workerType>:<workerId>:inbox`.
pub fn inbox_key(worker_type: &str, worker_id: &str) -> String {
    format!("agent:{}:{}:inbox", worker_type, worker_id)
}

/// Fallback reply destination for a sender that named no `reply_to`.
pub fn sender_inbox(sender: &str) -> String {
    format!("agent:{}:inbox", sender)
}

pub struct Messaging {
    broker: Arc<dyn LogBroker>,
    agent_id: String,
    inbox: String,
    cursor: AtomicU64,
    retry_backoff: Duration,
}

impl Messaging {
    pub fn new(broker: Arc<dyn LogBroker>, agent_type: &str, agent_id: &str) -> Self {
        Self {
            broker,
            agent_id: agent_id.to_string(),
            inbox: inbox_key(agent_type, agent_id),
            cursor: AtomicU64::new(0),
            retry_backoff: READ_RETRY_BACKOFF,
        }
    }

    #[cfg(test)]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Continue reading after `cursor`, e.g. the one saved in a checkpoint.
    pub fn resume_after(&self, cursor: u64) {
        self.cursor.fetch_max(cursor, Ordering::SeqCst);
    }

    /// Block until the next message in this worker's inbox arrives.
    ///
    /// Read errors are retried after a fixed backoff rather than surfaced.
    /// Entries that fail to decode are skipped; the cursor still moves past them.
    pub async fn receive(&self) -> InboundMessage {
        loop {
            let after = self.cursor.load(Ordering::SeqCst);
            let entry = match self.broker.read_next(&self.inbox, after).await {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Error reading from inbox {}: {}", self.inbox, e);
                    tokio::time::sleep(self.retry_backoff).await;
                    continue;
                }
            };
            self.cursor.fetch_max(entry.id, Ordering::SeqCst);

            match serde_json::from_str::<InboundMessage>(&entry.data) {
                Ok(mut message) => {
                    if message.id.is_empty() {
                        message.id = entry.id.to_string();
                    }
                    return message;
                }
                Err(e) => {
                    error!(
                        "Skipping undecodable entry {} on {}: {}",
                        entry.id, self.inbox, e
                    );
                }
            }
        }
    }

    /// `receive` bounded by `timeout`; `None` when nothing arrived in time.
    pub async fn receive_timeout(&self, timeout: Duration) -> Option<InboundMessage> {
        tokio::time::timeout(timeout, self.receive()).await.ok()
    }

    /// Append `message` to `destination`.
    pub async fn send(&self, destination: &str, message: &InboundMessage) -> Result<u64> {
        let data = serde_json::to_string(message)?;
        self.broker.append(destination, &data).await
    }

    /// Reply to `original`, fire-and-forget.
    ///
    /// Goes to `original.reply_to`, else to the sender's inbox, and carries the
    /// original id in `reply_to` for correlation.
    pub async fn reply(&self, original: &InboundMessage, payload: serde_json::Value) {
        let destination = original
            .reply_to
            .clone()
            .unwrap_or_else(|| sender_inbox(&original.sender));
        let reply = InboundMessage::new(original.id.clone(), self.agent_id.clone(), "reply", payload)
            .with_reply_to(original.id.clone());
        if let Err(e) = self.send(&destination, &reply).await {
            warn!("Error sending reply to {}: {}", destination, e);
        }
    }
}
