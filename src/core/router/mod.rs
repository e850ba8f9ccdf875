//! Per-key router: maps each client key to a dedicated worker, provisioning
//! one on first contact and forwarding every message to it.
//!
//! The router is itself a worker (`chatbot-router`); its mapping lives in
//! `RouterState` and is checkpointed like any other worker state. Workers it
//! provisions carry labels identifying the client key, so a router that lost
//! its state adopts them instead of provisioning duplicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::backend::{BackendError, LabelSelector};
use crate::core::clock::Clock;
use crate::core::config::RouterConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::messaging::{inbox_key, sender_inbox};
use crate::core::types::{InboundMessage, WorkerSpec};
use crate::core::worker::{WorkerContext, WorkerHooks, WorkerState};

pub const ROUTER_TYPE: &str = "chatbot-router";

pub const LABEL_WORKER_TYPE: &str = "agentbox.io/worker-type";
pub const LABEL_CLIENT_KEY: &str = "agentbox.io/client-key-hash";

pub const NOT_UNDERSTOOD: &str = "Sorry, I couldn't understand your message.";
pub const ROUTING_FAILED: &str = "Sorry, I'm having trouble processing your message right now.";

const MAX_KEY_FRAGMENT: usize = 40;

/// How routed workers are provisioned.
#[derive(Debug, Clone)]
pub struct RouterPolicy {
    pub worker_type: String,
    pub image: String,
    pub name_prefix: String,
    pub ttl_seconds: u64,
    pub ready_timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub service_account: Option<String>,
}

impl RouterPolicy {
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut env = BTreeMap::new();
        env.insert("MODEL_NAME".to_string(), config.model_name.clone());
        Self {
            worker_type: config.worker_type.clone(),
            image: config.image.clone(),
            name_prefix: config.name_prefix.clone(),
            ttl_seconds: config.ttl_seconds,
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
            env,
            service_account: config.service_account.clone(),
        }
    }
}

/// A forwarded message whose reply has not come back yet.
///
/// Keyed in `RouterState::pending_replies` by [`pending_key`], since message
/// ids are chosen by clients and only unique per worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReply {
    pub destination: String,
    pub worker: String,
    pub forwarded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterState {
    pub user_agents: BTreeMap<String, String>,
    pub agent_status: BTreeMap<String, String>,
    pub agent_last_active: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub pending_replies: BTreeMap<String, PendingReply>,
}

impl WorkerState for RouterState {}

impl RouterState {
    fn remember(&mut self, client_key: &str, worker: &str, status: &str, now: DateTime<Utc>) {
        self.user_agents
            .insert(client_key.to_string(), worker.to_string());
        self.agent_status
            .insert(worker.to_string(), status.to_string());
        self.agent_last_active.insert(worker.to_string(), now);
    }

    fn forget(&mut self, client_key: &str, worker: &str) {
        if self.user_agents.get(client_key).map(String::as_str) == Some(worker) {
            self.user_agents.remove(client_key);
        }
        self.agent_status.remove(worker);
        self.agent_last_active.remove(worker);
        self.pending_replies.retain(|_, p| p.worker != worker);
    }
}

/// `pending_replies` key for a message forwarded to `worker`.
pub fn pending_key(worker: &str, message_id: &str) -> String {
    format!("{}/{}", worker, message_id)
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("failed to provision a worker for {client_key}: {reason}")]
    Provision { client_key: String, reason: String },

    #[error("worker {0} did not become ready")]
    NotReady(String),

    #[error("failed to forward to {worker}: {reason}")]
    Forward { worker: String, reason: String },
}

/// DNS-label-safe fragment of a client key.
pub fn sanitize_key(client_key: &str) -> String {
    let mapped: String = client_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let mut fragment = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if c == '-' && (fragment.is_empty() || fragment.ends_with('-')) {
            continue;
        }
        fragment.push(c);
    }
    fragment.truncate(MAX_KEY_FRAGMENT);
    let fragment = fragment.trim_end_matches('-');
    if fragment.is_empty() {
        "anon".to_string()
    } else {
        fragment.to_string()
    }
}

/// Label value identifying a client key. Raw keys may not be valid label values.
pub fn client_key_label(client_key: &str) -> String {
    let digest = Sha256::digest(client_key.as_bytes());
    digest
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct ChatRouter {
    lifecycle: Arc<LifecycleManager>,
    clock: Arc<dyn Clock>,
    policy: RouterPolicy,
}

impl ChatRouter {
    pub fn new(lifecycle: Arc<LifecycleManager>, clock: Arc<dyn Clock>, policy: RouterPolicy) -> Self {
        Self {
            lifecycle,
            clock,
            policy,
        }
    }

    fn worker_name(&self, client_key: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            self.policy.name_prefix,
            sanitize_key(client_key),
            &suffix[..8]
        )
    }

    fn selector(&self, client_key: &str) -> LabelSelector {
        let mut selector = LabelSelector::new();
        selector.insert(LABEL_WORKER_TYPE.to_string(), self.policy.worker_type.clone());
        selector.insert(LABEL_CLIENT_KEY.to_string(), client_key_label(client_key));
        selector
    }

    fn worker_spec(&self, name: &str, client_key: &str) -> WorkerSpec {
        let mut spec = WorkerSpec::new(name, &self.policy.worker_type, &self.policy.image)
            .env("AGENT_TYPE", &self.policy.worker_type)
            .env("AGENT_ID", name)
            .service_account(self.policy.service_account.clone())
            .ttl_seconds(Some(self.policy.ttl_seconds));
        for (key, value) in &self.policy.env {
            spec = spec.env(key, value);
        }
        for (key, value) in self.selector(client_key) {
            spec = spec.label(key, value);
        }
        spec
    }

    /// A live worker already labelled for this client, if any.
    async fn adopt(&self, client_key: &str) -> Option<String> {
        self.lifecycle
            .list(Some(&self.selector(client_key)))
            .await
            .into_iter()
            .find(|record| record.phase.is_live())
            .map(|record| record.spec.name)
    }

    /// The worker serving `client_key`, provisioning one when none exists.
    pub async fn resolve_or_create_worker(
        &self,
        state: &mut RouterState,
        client_key: &str,
    ) -> Result<String, RouteError> {
        if let Some(worker) = state.user_agents.get(client_key) {
            info!("Found existing worker {} for {}", worker, client_key);
            return Ok(worker.clone());
        }

        if let Some(worker) = self.adopt(client_key).await {
            info!("Adopting running worker {} for {}", worker, client_key);
            state.remember(client_key, &worker, "provisioning", self.clock.now());
            return Ok(worker);
        }

        let mut retried = false;
        loop {
            let worker = self.worker_name(client_key);
            info!("Creating new worker {} for {}", worker, client_key);
            match self
                .lifecycle
                .try_create(&self.worker_spec(&worker, client_key))
                .await
            {
                Ok(()) => {
                    state.remember(client_key, &worker, "provisioning", self.clock.now());
                    return Ok(worker);
                }
                Err(BackendError::Conflict(_)) if !retried => {
                    warn!("Name {} already taken, retrying with a new suffix", worker);
                    retried = true;
                }
                Err(e) => {
                    return Err(RouteError::Provision {
                        client_key: client_key.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Deliver `text` from `client_key` to its worker. Replies come back to
    /// the router inbox correlated by `message_id`.
    pub async fn route_message(
        &self,
        ctx: &WorkerContext,
        state: &mut RouterState,
        client_key: &str,
        text: &str,
        message_id: &str,
    ) -> Result<String, RouteError> {
        let mut worker = self.resolve_or_create_worker(state, client_key).await?;

        state
            .agent_last_active
            .insert(worker.clone(), self.clock.now());
        match self.lifecycle.try_refresh_activity(&worker).await {
            Ok(()) => {}
            Err(BackendError::NotFound(_)) => {
                warn!(
                    "Worker {} for {} no longer exists, provisioning a replacement",
                    worker, client_key
                );
                state.forget(client_key, &worker);
                worker = self.resolve_or_create_worker(state, client_key).await?;
            }
            // the record may still exist; keep the mapping
            Err(e) => warn!("Could not refresh worker {}: {}", worker, e),
        }

        // a slow start keeps its mapping so the next message can reuse it
        if !self
            .lifecycle
            .wait_ready(&worker, self.policy.ready_timeout)
            .await
        {
            error!("Worker {} failed to become ready", worker);
            state
                .agent_status
                .insert(worker.clone(), "provisioning".to_string());
            return Err(RouteError::NotReady(worker));
        }
        state
            .agent_status
            .insert(worker.clone(), "ready".to_string());

        let forward = InboundMessage::new(message_id, client_key, "message", json!({ "text": text }))
            .with_reply_to(ctx.messaging.inbox());
        let destination = inbox_key(&self.policy.worker_type, &worker);
        ctx.messaging
            .send(&destination, &forward)
            .await
            .map_err(|e| RouteError::Forward {
                worker: worker.clone(),
                reason: e.to_string(),
            })?;
        info!("Message {} routed to worker {}", message_id, worker);
        Ok(worker)
    }

    async fn relay_reply(&self, ctx: &WorkerContext, state: &mut RouterState, reply: &InboundMessage) {
        let Some(correlation) = reply.reply_to.as_deref() else {
            warn!("Reply {} from {} carries no correlation id", reply.id, reply.sender);
            return;
        };
        // only the worker the message went to can settle it
        let key = pending_key(&reply.sender, correlation);
        let Some(pending) = state.pending_replies.remove(&key) else {
            warn!(
                "No client waiting for reply to {} from {}, dropping it",
                correlation, reply.sender
            );
            return;
        };
        let relayed = InboundMessage::new(
            correlation,
            ctx.agent_id.clone(),
            "reply",
            reply.payload.clone(),
        )
        .with_reply_to(correlation);
        if let Err(e) = ctx.messaging.send(&pending.destination, &relayed).await {
            warn!("Failed to relay reply to {}: {}", pending.destination, e);
        }
    }

    /// Pending replies older than the worker TTL will never arrive.
    fn prune_pending(&self, state: &mut RouterState) {
        let ttl = chrono::Duration::seconds(self.policy.ttl_seconds as i64);
        let now = self.clock.now();
        state
            .pending_replies
            .retain(|_, pending| now - pending.forwarded_at < ttl);
    }
}

#[async_trait]
impl WorkerHooks for ChatRouter {
    type State = RouterState;

    async fn initialize(&mut self, ctx: &WorkerContext, state: &mut RouterState) -> anyhow::Result<()> {
        info!(
            "Router {} ready, {} known client(s)",
            ctx.agent_id,
            state.user_agents.len()
        );
        Ok(())
    }

    async fn handle_message(
        &mut self,
        ctx: &WorkerContext,
        state: &mut RouterState,
        message: &InboundMessage,
    ) -> anyhow::Result<()> {
        self.prune_pending(state);

        if message.kind == "reply" {
            self.relay_reply(ctx, state, message).await;
            return Ok(());
        }

        let Some(text) = message.text() else {
            warn!("Message {} from {} has no text payload", message.id, message.sender);
            ctx.messaging
                .reply(message, json!({ "text": NOT_UNDERSTOOD }))
                .await;
            return Ok(());
        };

        match self
            .route_message(ctx, state, &message.sender, text, &message.id)
            .await
        {
            Ok(worker) => {
                let destination = message
                    .reply_to
                    .clone()
                    .unwrap_or_else(|| sender_inbox(&message.sender));
                state.pending_replies.insert(
                    pending_key(&worker, &message.id),
                    PendingReply {
                        destination,
                        worker,
                        forwarded_at: self.clock.now(),
                    },
                );
            }
            Err(e) => {
                error!("Routing message {} from {} failed: {}", message.id, message.sender, e);
                ctx.messaging
                    .reply(message, json!({ "text": ROUTING_FAILED }))
                    .await;
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &WorkerContext, _state: &mut RouterState) {
        info!("Router {} cleaning up before shutdown", ctx.agent_id);
    }
}

#[cfg(test)]
mod tests;
