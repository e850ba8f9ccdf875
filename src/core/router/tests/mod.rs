mod end_to_end;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::core::backend::InMemoryBackend;
use crate::core::clock::{Clock, ManualClock};
use crate::core::config::RouterConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::messaging::{InMemoryBroker, Messaging};
use crate::core::router::{ChatRouter, ROUTER_TYPE, RouterPolicy};
use crate::core::store::SqliteStore;
use crate::core::types::InboundMessage;
use crate::core::worker::WorkerContext;

pub(super) const ROUTER_INBOX: &str = "agent:chatbot-router:router:inbox";

pub(super) struct Fixture {
    pub backend: Arc<InMemoryBackend>,
    pub lifecycle: Arc<LifecycleManager>,
    pub clock: Arc<ManualClock>,
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<SqliteStore>,
}

impl Fixture {
    pub fn new(auto_ready: bool) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut backend = InMemoryBackend::new(clock.clone());
        if auto_ready {
            backend = backend.with_auto_ready();
        }
        let backend = Arc::new(backend);
        let lifecycle = Arc::new(
            LifecycleManager::new(backend.clone(), clock.clone())
                .with_poll_interval(Duration::from_millis(10)),
        );
        Self {
            backend,
            lifecycle,
            clock,
            broker: Arc::new(InMemoryBroker::new()),
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
        }
    }

    pub fn policy(&self) -> RouterPolicy {
        let mut policy = RouterPolicy::from_config(&RouterConfig::default());
        policy.ready_timeout = Duration::from_millis(100);
        policy
    }

    pub fn router(&self) -> ChatRouter {
        let clock: Arc<dyn Clock> = self.clock.clone();
        ChatRouter::new(self.lifecycle.clone(), clock, self.policy())
    }

    pub fn context(&self, agent_type: &str, agent_id: &str) -> WorkerContext {
        WorkerContext {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            checkpoints: self.store.clone(),
            status: self.store.clone(),
            messaging: Messaging::new(self.broker.clone(), agent_type, agent_id)
                .with_retry_backoff(Duration::from_millis(5)),
        }
    }

    pub fn router_context(&self) -> WorkerContext {
        self.context(ROUTER_TYPE, "router")
    }

    pub async fn messages(&self, stream_key: &str) -> Vec<InboundMessage> {
        self.broker
            .entries(stream_key)
            .await
            .iter()
            .map(|e| serde_json::from_str(&e.data).unwrap())
            .collect()
    }

    /// Poll `stream_key` until it holds at least `count` messages.
    pub async fn wait_for(&self, stream_key: &str, count: usize) -> Vec<InboundMessage> {
        for _ in 0..400 {
            let messages = self.messages(stream_key).await;
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} message(s) on {stream_key}");
    }
}
